//! Commands every deployment ships with.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::{CommandBinding, CommandHandler, CommandRegistry, Invocation};
use crate::store::settings::{
    digits, AntiDeleteSettings, AutoResponderSettings, ForwardSettings, ViewOnceSettings,
};

const AR_USAGE: &str = "Usage:\n\
    .ar status\n\
    .ar on | off\n\
    .ar ignore add|remove <number>\n\
    .ar ignore list | clear\n\
    .ar personality <text>";

const FORWARD_USAGE: &str = "Usage: <mode>\n\
    p / sudo - forward to the owner\n\
    g - forward to the same chat\n\
    <address> - forward to a specific chat\n\
    null / false - disable";

pub fn register_builtins(registry: &mut CommandRegistry) {
    registry.register(
        CommandBinding::new("ping|p", Arc::new(Ping))
            .describe("Check that the bot is alive")
            .category("general"),
    );
    registry.register(
        CommandBinding::new("menu|help", Arc::new(Menu))
            .describe("List available commands")
            .category("general"),
    );
    registry.register(
        CommandBinding::new("ar", Arc::new(AutoResponderCommand))
            .describe("Configure the auto-responder")
            .category("whatsapp")
            .self_only(),
    );
    registry.register(
        CommandBinding::new("antidelete", Arc::new(SetForward(ForwardKind::AntiDelete)))
            .describe("Forward deleted messages")
            .category("whatsapp")
            .self_only(),
    );
    registry.register(
        CommandBinding::new("getantidelete", Arc::new(GetForward(ForwardKind::AntiDelete)))
            .describe("Show anti-delete settings")
            .category("whatsapp")
            .self_only(),
    );
    registry.register(
        CommandBinding::new("setvv", Arc::new(SetForward(ForwardKind::ViewOnce)))
            .describe("Forward view-once media")
            .category("whatsapp")
            .self_only(),
    );
    registry.register(
        CommandBinding::new("getvv", Arc::new(GetForward(ForwardKind::ViewOnce)))
            .describe("Show view-once settings")
            .category("whatsapp")
            .self_only(),
    );
}

struct Ping;

#[async_trait]
impl CommandHandler for Ping {
    async fn execute(&self, inv: Invocation) -> anyhow::Result<()> {
        let started = std::time::Instant::now();
        inv.ctx.react(&inv.message, "🏓").await?;
        inv.ctx
            .reply(
                &inv.message,
                format!("🏓 Pong! ({} ms)", started.elapsed().as_millis()),
            )
            .await?;
        Ok(())
    }
}

struct Menu;

fn render_menu(prefix: &str, registry: &CommandRegistry) -> String {
    let mut by_category: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for binding in registry.bindings() {
        let Some(name) = binding.names().first() else {
            continue;
        };
        let line = if binding.description.is_empty() {
            format!("{}{}", prefix, name)
        } else {
            format!("{}{} - {}", prefix, name, binding.description)
        };
        by_category.entry(binding.category.as_str()).or_default().push(line);
    }

    let mut menu = String::from("📋 *Commands*\n");
    for (category, lines) in by_category {
        menu.push_str(&format!("\n*{}*\n", category.to_uppercase()));
        for line in lines {
            menu.push_str(&line);
            menu.push('\n');
        }
    }
    menu.trim_end().to_string()
}

#[async_trait]
impl CommandHandler for Menu {
    async fn execute(&self, inv: Invocation) -> anyhow::Result<()> {
        let menu = render_menu(inv.ctx.prefix(), &inv.registry);
        inv.ctx.reply(&inv.message, menu).await?;
        Ok(())
    }
}

struct AutoResponderCommand;

impl AutoResponderCommand {
    fn status(settings: &AutoResponderSettings) -> String {
        let ignored = if settings.ignore_numbers.is_empty() {
            "none".to_string()
        } else {
            settings.ignore_numbers.join(", ")
        };
        format!(
            "🤖 *Auto-responder*\nStatus: {}\nIgnored: {}\nPersonality: {}",
            if settings.enabled { "enabled" } else { "disabled" },
            ignored,
            settings.personality
        )
    }

    /// Apply one `ar` sub-command; `None` means the arguments were not understood.
    /// Returns the reply and whether the settings changed.
    fn apply(settings: &mut AutoResponderSettings, args: &str) -> Option<(String, bool)> {
        let mut words = args.split_whitespace();
        let action = words.next().unwrap_or("status").to_lowercase();
        let reply = match action.as_str() {
            "status" => (Self::status(settings), false),
            "on" => {
                settings.enabled = true;
                ("✅ Auto-responder enabled".to_string(), true)
            }
            "off" => {
                settings.enabled = false;
                ("✅ Auto-responder disabled".to_string(), true)
            }
            "ignore" => {
                let sub = words.next().unwrap_or_default().to_lowercase();
                let number = words.next().map(digits).filter(|n| !n.is_empty());
                match (sub.as_str(), number) {
                    ("add", Some(number)) => {
                        if settings.is_ignored(&number) {
                            (format!("{} is already ignored", number), false)
                        } else {
                            settings.ignore_numbers.push(number.clone());
                            (format!("✅ Ignoring {}", number), true)
                        }
                    }
                    ("remove", Some(number)) => {
                        let before = settings.ignore_numbers.len();
                        settings.ignore_numbers.retain(|n| *n != number);
                        if settings.ignore_numbers.len() == before {
                            (format!("{} is not in the ignore list", number), false)
                        } else {
                            (format!("✅ No longer ignoring {}", number), true)
                        }
                    }
                    ("list", _) => {
                        if settings.ignore_numbers.is_empty() {
                            ("Ignore list is empty".to_string(), false)
                        } else {
                            (
                                format!("Ignored numbers:\n{}", settings.ignore_numbers.join("\n")),
                                false,
                            )
                        }
                    }
                    ("clear", _) => {
                        settings.ignore_numbers.clear();
                        ("✅ Ignore list cleared".to_string(), true)
                    }
                    _ => return None,
                }
            }
            "personality" => {
                let text = words.collect::<Vec<_>>().join(" ");
                if text.is_empty() {
                    (format!("Current personality: {}", settings.personality), false)
                } else {
                    settings.personality = text;
                    ("✅ Personality updated".to_string(), true)
                }
            }
            _ => return None,
        };
        Some(reply)
    }
}

#[async_trait]
impl CommandHandler for AutoResponderCommand {
    async fn execute(&self, inv: Invocation) -> anyhow::Result<()> {
        let mut settings = inv.ctx.auto_responder_settings().await?;
        let Some((reply, changed)) = Self::apply(&mut settings, &inv.args) else {
            inv.ctx.reply(&inv.message, AR_USAGE).await?;
            return Ok(());
        };
        if changed {
            inv.ctx.save_settings(&settings).await?;
            inv.ctx.react(&inv.message, "✅").await?;
        }
        inv.ctx.reply(&inv.message, reply).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum ForwardKind {
    AntiDelete,
    ViewOnce,
}

impl ForwardKind {
    fn label(self) -> &'static str {
        match self {
            ForwardKind::AntiDelete => "Anti-delete",
            ForwardKind::ViewOnce => "View-once",
        }
    }
}

struct SetForward(ForwardKind);

#[async_trait]
impl CommandHandler for SetForward {
    async fn execute(&self, inv: Invocation) -> anyhow::Result<()> {
        let label = self.0.label();
        let Some(settings) = ForwardSettings::parse_mode(&inv.args) else {
            inv.ctx
                .reply(&inv.message, format!("{} {}", label, FORWARD_USAGE))
                .await?;
            return Ok(());
        };
        match self.0 {
            ForwardKind::AntiDelete => {
                let document = AntiDeleteSettings(settings.clone());
                inv.ctx.save_settings(&document).await?;
            }
            ForwardKind::ViewOnce => {
                let document = ViewOnceSettings(settings.clone());
                inv.ctx.save_settings(&document).await?;
            }
        }
        inv.ctx.react(&inv.message, "✅").await?;
        inv.ctx
            .reply(
                &inv.message,
                format!("✅ {} settings updated: {}", label, settings.describe()),
            )
            .await?;
        Ok(())
    }
}

struct GetForward(ForwardKind);

#[async_trait]
impl CommandHandler for GetForward {
    async fn execute(&self, inv: Invocation) -> anyhow::Result<()> {
        let settings = match self.0 {
            ForwardKind::AntiDelete => inv.ctx.anti_delete_settings().await?.0,
            ForwardKind::ViewOnce => inv.ctx.view_once_settings().await?.0,
        };
        inv.ctx
            .reply(
                &inv.message,
                format!("ℹ️ {}: {}", self.0.label(), settings.describe()),
            )
            .await?;
        Ok(())
    }
}
