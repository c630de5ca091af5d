pub mod builtin;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use indexmap::IndexMap;
use tracing::{debug, error, info, warn};

use crate::context::BotContext;
use crate::errors::BotError;
use crate::message::Message;

pub const GENERIC_FAILURE_REPLY: &str = "❌ Something went wrong while running this command.";

/// Who may run a command. Checks run in field order and stop at the first failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Authorization {
    /// Sent by the bot's own account or a privileged sender
    pub self_only: bool,
    pub group_only: bool,
    pub direct_only: bool,
    /// Sender is in the configured sudo list
    pub owner_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    SelfOnly,
    GroupOnly,
    DirectOnly,
    OwnerOnly,
}

impl Rejection {
    pub fn reply_text(self) -> &'static str {
        match self {
            Rejection::SelfOnly => "❌ This command is only for sudo users",
            Rejection::GroupOnly => "❌ This command can only be used in groups",
            Rejection::DirectOnly => "❌ This command can only be used in private chat",
            Rejection::OwnerOnly => "❌ This command is restricted to bot owners",
        }
    }
}

impl Authorization {
    pub fn check(&self, ctx: &BotContext, message: &Message) -> Option<Rejection> {
        if self.self_only && !(message.from_self || ctx.is_sudo(&message.sender_id)) {
            return Some(Rejection::SelfOnly);
        }
        if self.group_only && !message.is_group {
            return Some(Rejection::GroupOnly);
        }
        if self.direct_only && message.is_group {
            return Some(Rejection::DirectOnly);
        }
        if self.owner_only && !ctx.is_sudo(&message.sender_id) {
            return Some(Rejection::OwnerOnly);
        }
        None
    }
}

/// Everything a handler gets for one run.
pub struct Invocation {
    pub ctx: Arc<BotContext>,
    pub message: Message,
    /// Text after the command name, trimmed
    pub args: String,
    pub registry: Arc<CommandRegistry>,
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn execute(&self, invocation: Invocation) -> anyhow::Result<()>;

    /// Whether this handler wants to see replies before normal dispatch.
    fn intercepts_replies(&self) -> bool {
        false
    }

    /// Offered every message that quotes another one; return `true` once handled.
    async fn intercept_reply(&self, _ctx: &Arc<BotContext>, _message: &Message) -> anyhow::Result<bool> {
        Ok(false)
    }
}

pub struct CommandBinding {
    pub pattern: String,
    pub description: String,
    pub category: String,
    pub auth: Authorization,
    pub handler: Arc<dyn CommandHandler>,
    names: Vec<String>,
}

impl CommandBinding {
    pub fn new(pattern: &str, handler: Arc<dyn CommandHandler>) -> Self {
        let names = pattern
            .split('|')
            .map(|n| n.trim().to_lowercase())
            .filter(|n| !n.is_empty())
            .collect();
        Self {
            pattern: pattern.trim().to_string(),
            description: String::new(),
            category: "misc".to_string(),
            auth: Authorization::default(),
            handler,
            names,
        }
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn category(mut self, category: &str) -> Self {
        self.category = category.to_string();
        self
    }

    pub fn self_only(mut self) -> Self {
        self.auth.self_only = true;
        self
    }

    pub fn group_only(mut self) -> Self {
        self.auth.group_only = true;
        self
    }

    pub fn direct_only(mut self) -> Self {
        self.auth.direct_only = true;
        self
    }

    pub fn owner_only(mut self) -> Self {
        self.auth.owner_only = true;
        self
    }

    /// Alternative names, lowercased.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Full-token, case-insensitive match against any alternative.
    /// `name` must already be lowercase.
    fn matches(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    fn key(&self) -> String {
        self.names.join("|")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Body does not start with the prefix
    NotCommand,
    NoMatch,
    Rejected(Rejection),
    Executed,
    Failed,
}

/// Ordered pattern → handler bindings.
#[derive(Default)]
pub struct CommandRegistry {
    bindings: IndexMap<String, CommandBinding>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding. A binding with the same pattern as an earlier one
    /// replaces it in place. Returns `false` if the pattern has no names.
    pub fn register(&mut self, binding: CommandBinding) -> bool {
        if binding.names.is_empty() {
            warn!("command registry: rejecting binding with empty pattern");
            return false;
        }
        let key = binding.key();
        if self.bindings.contains_key(&key) {
            info!("command registry: '{}' re-registered, last one wins", key);
        }
        self.bindings.insert(key, binding);
        true
    }

    pub fn bindings(&self) -> impl Iterator<Item = &CommandBinding> {
        self.bindings.values()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Offer a quoting message to intercepting handlers, in registration order.
    /// Returns `true` if one of them handled it.
    pub async fn intercept(&self, ctx: &Arc<BotContext>, message: &Message) -> bool {
        if message.quoted.is_none() {
            return false;
        }
        for binding in self.bindings.values().filter(|b| b.handler.intercepts_replies()) {
            let attempt = AssertUnwindSafe(binding.handler.intercept_reply(ctx, message))
                .catch_unwind()
                .await;
            match attempt {
                Ok(Ok(true)) => {
                    debug!(command = %binding.pattern, "Reply intercepted");
                    return true;
                }
                Ok(Ok(false)) => {}
                Ok(Err(e)) => warn!(command = %binding.pattern, "Reply intercept failed: {:#}", e),
                Err(panic) => error!(
                    command = %binding.pattern,
                    "Reply intercept panicked: {}",
                    panic_message(panic.as_ref())
                ),
            }
        }
        false
    }

    /// Run the command in `message`, if any.
    ///
    /// Only the first binding whose pattern matches is considered; a policy
    /// rejection or handler failure ends dispatch and is answered in-chat.
    pub async fn dispatch(self: &Arc<Self>, ctx: &Arc<BotContext>, message: &Message) -> DispatchOutcome {
        let Some(rest) = message.body.strip_prefix(ctx.prefix()) else {
            return DispatchOutcome::NotCommand;
        };
        let rest = rest.trim();
        let (name, args) = match rest.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (rest, ""),
        };
        if name.is_empty() {
            return DispatchOutcome::NoMatch;
        }
        let name = name.to_lowercase();

        let Some(binding) = self.bindings.values().find(|b| b.matches(&name)) else {
            debug!(command = %name, "No binding matched");
            return DispatchOutcome::NoMatch;
        };

        if let Some(rejection) = binding.auth.check(ctx, message) {
            info!(
                command = %binding.pattern,
                sender = %message.sender_id,
                ?rejection,
                "Command rejected"
            );
            if let Err(e) = ctx.reply(message, rejection.reply_text()).await {
                warn!("Failed to send rejection reply: {}", e);
            }
            return DispatchOutcome::Rejected(rejection);
        }

        info!(
            command = %binding.pattern,
            chat = %message.chat_id,
            sender = %message.sender_id,
            "Executing command"
        );
        let invocation = Invocation {
            ctx: ctx.clone(),
            message: message.clone(),
            args: args.to_string(),
            registry: self.clone(),
        };
        let result = AssertUnwindSafe(binding.handler.execute(invocation))
            .catch_unwind()
            .await;
        let failure = match result {
            Ok(Ok(())) => return DispatchOutcome::Executed,
            Ok(Err(e)) => format!("{:#}", e),
            Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
        };
        let err = BotError::Handler {
            command: binding.pattern.clone(),
            message: failure,
        };
        error!("{}", err);
        if let Err(e) = ctx.reply(message, GENERIC_FAILURE_REPLY).await {
            warn!("Failed to send failure reply: {}", e);
        }
        DispatchOutcome::Failed
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::Config;
    use crate::testing::{context_with, direct_text, group_text, self_text};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Records every invocation's arguments.
    #[derive(Default)]
    pub(crate) struct Recorder {
        pub args: Mutex<Vec<String>>,
    }

    impl Recorder {
        pub fn calls(&self) -> usize {
            self.args.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl CommandHandler for Recorder {
        async fn execute(&self, invocation: Invocation) -> anyhow::Result<()> {
            self.args.lock().unwrap().push(invocation.args);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl CommandHandler for Failing {
        async fn execute(&self, _invocation: Invocation) -> anyhow::Result<()> {
            anyhow::bail!("upstream API unavailable")
        }
    }

    struct Panicking;

    #[async_trait]
    impl CommandHandler for Panicking {
        async fn execute(&self, _invocation: Invocation) -> anyhow::Result<()> {
            panic!("handler bug")
        }
    }

    /// Handles replies whose body is a number.
    struct Guess {
        seen: AtomicUsize,
    }

    #[async_trait]
    impl CommandHandler for Guess {
        async fn execute(&self, _invocation: Invocation) -> anyhow::Result<()> {
            Ok(())
        }

        fn intercepts_replies(&self) -> bool {
            true
        }

        async fn intercept_reply(&self, _ctx: &Arc<BotContext>, message: &Message) -> anyhow::Result<bool> {
            if message.body.trim().parse::<u32>().is_ok() {
                self.seen.fetch_add(1, Ordering::SeqCst);
                return Ok(true);
            }
            Ok(false)
        }
    }

    fn registry_with(bindings: Vec<CommandBinding>) -> Arc<CommandRegistry> {
        let mut registry = CommandRegistry::new();
        for binding in bindings {
            assert!(registry.register(binding));
        }
        Arc::new(registry)
    }

    #[tokio::test]
    async fn test_matches_case_insensitive_full_token() {
        let (ctx, _) = context_with(Config::default());
        let help = Arc::new(Recorder::default());
        let registry = registry_with(vec![CommandBinding::new("help", help.clone())]);

        for body in [".Help", ".help", ".HELP topic"] {
            let outcome = registry.dispatch(&ctx, &direct_text("15551234567", body)).await;
            assert_eq!(outcome, DispatchOutcome::Executed, "{}", body);
        }
        let outcome = registry
            .dispatch(&ctx, &direct_text("15551234567", ".helpme"))
            .await;
        assert_eq!(outcome, DispatchOutcome::NoMatch);
        assert_eq!(help.calls(), 3);
        assert_eq!(help.args.lock().unwrap()[2], "topic");
    }

    #[tokio::test]
    async fn test_alternatives_and_prefix() {
        let (ctx, transport) = context_with(Config::default());
        let ping = Arc::new(Recorder::default());
        let registry = registry_with(vec![CommandBinding::new("ping|p", ping.clone())]);

        let dispatch = |body: &'static str| {
            let ctx = ctx.clone();
            let registry = registry.clone();
            async move { registry.dispatch(&ctx, &direct_text("15551234567", body)).await }
        };

        assert_eq!(dispatch(".P").await, DispatchOutcome::Executed);
        assert_eq!(dispatch(".pingpong").await, DispatchOutcome::NoMatch);
        assert_eq!(dispatch("ping").await, DispatchOutcome::NotCommand);
        assert_eq!(dispatch(".").await, DispatchOutcome::NoMatch);
        assert_eq!(ping.calls(), 1);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_group_only_checked_before_owner_only() {
        let (ctx, transport) = context_with(Config::default());
        let recorder = Arc::new(Recorder::default());
        let registry = registry_with(vec![CommandBinding::new("kick", recorder.clone())
            .group_only()
            .owner_only()]);

        let outcome = registry
            .dispatch(&ctx, &direct_text("15551234567", ".kick"))
            .await;
        assert_eq!(outcome, DispatchOutcome::Rejected(Rejection::GroupOnly));
        assert_eq!(recorder.calls(), 0);
        assert_eq!(
            transport.sent_texts(),
            vec![Rejection::GroupOnly.reply_text().to_string()]
        );

        let outcome = registry
            .dispatch(&ctx, &group_text("15551234567", ".kick"))
            .await;
        assert_eq!(outcome, DispatchOutcome::Rejected(Rejection::OwnerOnly));
        assert_eq!(recorder.calls(), 0);
    }

    #[tokio::test]
    async fn test_self_only_allows_own_account_and_sudo() {
        let mut config = Config::default();
        config.bot.sudo = vec!["15559990000".into()];
        let (ctx, _) = context_with(config);
        let recorder = Arc::new(Recorder::default());
        let registry = registry_with(vec![CommandBinding::new("setvv", recorder.clone()).self_only()]);

        let stranger = registry
            .dispatch(&ctx, &direct_text("15551234567", ".setvv g"))
            .await;
        assert_eq!(stranger, DispatchOutcome::Rejected(Rejection::SelfOnly));

        let own = registry
            .dispatch(&ctx, &self_text("15551234567", ".setvv g"))
            .await;
        assert_eq!(own, DispatchOutcome::Executed);

        let sudo = registry
            .dispatch(&ctx, &direct_text("15559990000", ".setvv p"))
            .await;
        assert_eq!(sudo, DispatchOutcome::Executed);
        assert_eq!(recorder.calls(), 2);
    }

    #[tokio::test]
    async fn test_direct_only() {
        let (ctx, _) = context_with(Config::default());
        let recorder = Arc::new(Recorder::default());
        let registry = registry_with(vec![CommandBinding::new("dm", recorder.clone()).direct_only()]);
        let outcome = registry
            .dispatch(&ctx, &group_text("15551234567", ".dm"))
            .await;
        assert_eq!(outcome, DispatchOutcome::Rejected(Rejection::DirectOnly));
    }

    #[tokio::test]
    async fn test_handler_failure_and_panic_are_contained() {
        let (ctx, transport) = context_with(Config::default());
        let registry = registry_with(vec![
            CommandBinding::new("boom", Arc::new(Failing)),
            CommandBinding::new("crash", Arc::new(Panicking)),
        ]);

        let failed = registry
            .dispatch(&ctx, &direct_text("15551234567", ".boom"))
            .await;
        let panicked = registry
            .dispatch(&ctx, &direct_text("15551234567", ".crash"))
            .await;
        assert_eq!(failed, DispatchOutcome::Failed);
        assert_eq!(panicked, DispatchOutcome::Failed);
        assert_eq!(
            transport.sent_texts(),
            vec![GENERIC_FAILURE_REPLY.to_string(); 2]
        );
    }

    #[tokio::test]
    async fn test_first_match_only() {
        let (ctx, _) = context_with(Config::default());
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        let registry = registry_with(vec![
            CommandBinding::new("sticker|s", first.clone()).group_only(),
            CommandBinding::new("s|save", second.clone()),
        ]);
        let outcome = registry
            .dispatch(&ctx, &direct_text("15551234567", ".s"))
            .await;
        // the first binding rejects; the second is never tried
        assert_eq!(outcome, DispatchOutcome::Rejected(Rejection::GroupOnly));
        assert_eq!(second.calls(), 0);
    }

    #[test]
    fn test_register_rejects_empty_and_replaces_duplicates() {
        let mut registry = CommandRegistry::new();
        assert!(!registry.register(CommandBinding::new("", Arc::new(Recorder::default()))));
        assert!(!registry.register(CommandBinding::new(" | ", Arc::new(Recorder::default()))));

        registry.register(CommandBinding::new("ping|p", Arc::new(Recorder::default())).describe("old"));
        registry.register(CommandBinding::new("menu", Arc::new(Recorder::default())));
        registry.register(CommandBinding::new("Ping|P", Arc::new(Recorder::default())).describe("new"));

        let descriptions: Vec<_> = registry.bindings().map(|b| b.description.as_str()).collect();
        assert_eq!(registry.len(), 2);
        assert_eq!(descriptions, vec!["new", ""]);
    }

    #[tokio::test]
    async fn test_intercept_only_for_quoted_messages() {
        let (ctx, _) = context_with(Config::default());
        let guess = Arc::new(Guess {
            seen: AtomicUsize::new(0),
        });
        let registry = registry_with(vec![
            CommandBinding::new("ping", Arc::new(Recorder::default())),
            CommandBinding::new("guess", guess.clone()),
        ]);

        let plain = direct_text("15551234567", "42");
        assert!(!registry.intercept(&ctx, &plain).await);

        let mut reply = direct_text("15551234567", "42");
        reply.quoted = Some(crate::message::QuotedRef {
            id: Some("Q1".into()),
            sender: Some("15550000000@s.whatsapp.net".into()),
            payload: serde_json::Value::Null,
        });
        assert!(registry.intercept(&ctx, &reply).await);

        let text_reply = reply.with_body("not a number");
        assert!(!registry.intercept(&ctx, &text_reply).await);
        assert_eq!(guess.seen.load(Ordering::SeqCst), 1);
    }
}
