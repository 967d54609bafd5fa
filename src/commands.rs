use tracing::{debug, info};

use crate::platform::IncomingCommand;
use crate::subscribers::SubscriberRegistry;
use crate::VERSION;

/// Commands the bot answers, in the order `/help` lists them
pub const COMMANDS: &[&str] = &["help", "start", "subscribe", "unsubscribe"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Help,
    Subscribe,
    Unsubscribe,
}

impl Command {
    /// Parse the leading `/command` of a message, ignoring trailing
    /// arguments. A `/command@name` addressed to a different bot than
    /// `bot_username` is not ours and yields `None`. Without a known
    /// username every suffix is accepted.
    pub fn parse(text: &str, bot_username: Option<&str>) -> Option<Self> {
        let word = text.split_whitespace().next()?;
        let word = word.strip_prefix('/')?;
        let (name, target) = match word.split_once('@') {
            Some((name, target)) => (name, Some(target)),
            None => (word, None),
        };
        if let (Some(target), Some(me)) = (target, bot_username) {
            if !target.eq_ignore_ascii_case(me) {
                debug!("Ignoring /{} addressed to @{}", name, target);
                return None;
            }
        }
        match name.to_ascii_lowercase().as_str() {
            "help" | "start" => Some(Command::Help),
            "subscribe" => Some(Command::Subscribe),
            "unsubscribe" => Some(Command::Unsubscribe),
            _ => None,
        }
    }
}

pub fn help_text() -> String {
    let commands = COMMANDS
        .iter()
        .map(|c| format!("/{}", c))
        .collect::<Vec<_>>()
        .join("\n");
    format!("smsbot v{}\n\n{}", VERSION, commands)
}

/// Run a chat command against the registry and return the reply, if any.
pub async fn handle_command(
    registry: &SubscriberRegistry,
    cmd: &IncomingCommand,
    bot_username: Option<&str>,
) -> Option<String> {
    let command = Command::parse(&cmd.text, bot_username)?;
    info!(
        "{:?} command from {} ({})",
        command, cmd.user_name, cmd.sender
    );

    let reply = match command {
        Command::Help => {
            let status = if registry.contains(cmd.sender).await {
                "You are subscribed to updates."
            } else {
                "You are not subscribed to updates."
            };
            format!("{}\n\n{}", help_text(), status)
        }
        Command::Subscribe => {
            if registry.add(cmd.sender).await {
                "You have successfully subscribed to updates.".to_string()
            } else {
                info!("{} is already subscribed", cmd.sender);
                "You are already subscribed to updates.".to_string()
            }
        }
        Command::Unsubscribe => {
            if registry.remove(cmd.sender).await {
                "You have successfully unsubscribed from updates.".to_string()
            } else {
                info!("{} is not subscribed", cmd.sender);
                "You are not subscribed to updates.".to_string()
            }
        }
    };
    Some(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(sender: i64, text: &str) -> IncomingCommand {
        IncomingCommand {
            sender,
            user_name: "tester".to_string(),
            text: text.to_string(),
        }
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("/help", None), Some(Command::Help));
        assert_eq!(Command::parse("/start", None), Some(Command::Help));
        assert_eq!(Command::parse("/subscribe@smsbot", None), Some(Command::Subscribe));
        assert_eq!(Command::parse("/unsubscribe now", None), Some(Command::Unsubscribe));
        assert_eq!(Command::parse("/clear", None), None);
        assert_eq!(Command::parse("subscribe", None), None);
        assert_eq!(Command::parse("", None), None);
    }

    #[test]
    fn test_parse_checks_bot_suffix() {
        let me = Some("SmsRelayBot");
        assert_eq!(Command::parse("/subscribe", me), Some(Command::Subscribe));
        assert_eq!(Command::parse("/subscribe@SmsRelayBot", me), Some(Command::Subscribe));
        assert_eq!(Command::parse("/subscribe@smsrelaybot", me), Some(Command::Subscribe));
        assert_eq!(Command::parse("/subscribe@otherbot", me), None);
        assert_eq!(Command::parse("/help@otherbot extra", me), None);
    }

    #[test]
    fn test_help_lists_version_and_commands() {
        let text = help_text();
        assert!(text.starts_with(&format!("smsbot v{}", VERSION)));
        for c in COMMANDS {
            assert!(text.contains(&format!("/{}", c)));
        }
    }

    #[tokio::test]
    async fn test_help_reports_subscription_status() {
        let registry = SubscriberRegistry::new(vec![], vec![5]);

        let reply = handle_command(&registry, &cmd(5, "/help"), None).await.unwrap();
        assert!(reply.starts_with(&help_text()));
        assert!(reply.ends_with("You are subscribed to updates."));

        let reply = handle_command(&registry, &cmd(6, "/start"), None).await.unwrap();
        assert!(reply.ends_with("You are not subscribed to updates."));
    }

    #[tokio::test]
    async fn test_subscribe_then_duplicate() {
        let registry = SubscriberRegistry::new(vec![], vec![]);

        let reply = handle_command(&registry, &cmd(5, "/subscribe"), None).await.unwrap();
        assert!(reply.contains("successfully subscribed"));

        let reply = handle_command(&registry, &cmd(5, "/subscribe"), None).await.unwrap();
        assert!(reply.contains("already subscribed"));
        assert_eq!(registry.list().await, vec![5]);
    }

    #[tokio::test]
    async fn test_unsubscribe_then_absent() {
        let registry = SubscriberRegistry::new(vec![], vec![5, 6]);

        let reply = handle_command(&registry, &cmd(5, "/unsubscribe"), None).await.unwrap();
        assert!(reply.contains("successfully unsubscribed"));

        let reply = handle_command(&registry, &cmd(5, "/unsubscribe"), None).await.unwrap();
        assert!(reply.contains("not subscribed"));
        assert_eq!(registry.list().await, vec![6]);
    }

    #[tokio::test]
    async fn test_command_for_other_bot_is_ignored() {
        let registry = SubscriberRegistry::new(vec![], vec![]);
        let reply = handle_command(&registry, &cmd(5, "/subscribe@otherbot"), Some("smsbot")).await;
        assert!(reply.is_none());
        assert!(registry.list().await.is_empty());

        let reply = handle_command(&registry, &cmd(5, "/subscribe@SMSBOT"), Some("smsbot")).await;
        assert!(reply.unwrap().contains("successfully subscribed"));
        assert_eq!(registry.list().await, vec![5]);
    }

    #[tokio::test]
    async fn test_unknown_command_has_no_reply() {
        let registry = SubscriberRegistry::new(vec![], vec![]);
        assert!(handle_command(&registry, &cmd(1, "/bogus"), None).await.is_none());
        assert!(handle_command(&registry, &cmd(1, "hello there"), None).await.is_none());
        assert!(registry.list().await.is_empty());
    }
}
