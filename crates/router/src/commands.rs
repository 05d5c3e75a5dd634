//! Chat command grammar.
//!
//! Commands are `/`-prefixed; selectors accept either a 1-based number or a
//! case-insensitive name prefix. Unknown commands parse to
//! [`Command::Unknown`] so the router can reply with a help hint instead of
//! failing.

/// A parsed chat command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Status,
    Workspaces,
    Workspace(Option<String>),
    AddWorkspace { name: String, path: Option<String> },
    RemoveWorkspace(String),
    Models,
    Model(Option<String>),
    Providers,
    Provider(Option<String>),
    Cancel,
    NewTask,
    Pair(Option<String>),
    Shell(String),
    Approve(Option<String>),
    Deny(Option<String>),
    Queue { clear: bool },
    Retry,
    History,
    Skills,
    Skill(Option<String>),
    Settings,
    Debug,
    Version,
    Unknown(String),
}

impl Command {
    /// Parse `text` as a command. Returns `None` when the text is not
    /// `/`-prefixed.
    pub fn parse(text: &str) -> Option<Self> {
        let trimmed = text.trim();
        let rest = trimmed.strip_prefix('/')?;
        if rest.is_empty() {
            return Some(Self::Unknown(String::new()));
        }

        let mut parts = rest.splitn(2, char::is_whitespace);
        let name = parts.next().unwrap_or_default();
        // Strip a bot mention suffix ("/start@my_bot").
        let name = name.split('@').next().unwrap_or(name).to_lowercase();
        let args = parts.next().map(str::trim).unwrap_or_default();
        let arg_opt = || (!args.is_empty()).then(|| args.to_string());

        let command = match name.as_str() {
            "start" => Self::Start,
            "help" => Self::Help,
            "status" => Self::Status,
            "workspaces" => Self::Workspaces,
            "workspace" => Self::Workspace(arg_opt()),
            "addworkspace" => {
                let mut words = args.splitn(2, char::is_whitespace);
                let name = words.next().unwrap_or_default().to_string();
                if name.is_empty() {
                    return Some(Self::Unknown("addworkspace".into()));
                }
                let path = words.next().map(|p| p.trim().to_string()).filter(|p| !p.is_empty());
                Self::AddWorkspace { name, path }
            },
            "removeworkspace" => {
                if args.is_empty() {
                    return Some(Self::Unknown("removeworkspace".into()));
                }
                Self::RemoveWorkspace(args.to_string())
            },
            "models" => Self::Models,
            "model" => Self::Model(arg_opt()),
            "providers" => Self::Providers,
            "provider" => Self::Provider(arg_opt()),
            "cancel" => Self::Cancel,
            "newtask" => Self::NewTask,
            "pair" => Self::Pair(arg_opt()),
            "shell" => Self::Shell(args.to_string()),
            "approve" | "yes" | "y" => Self::Approve(arg_opt()),
            "deny" | "no" | "n" => Self::Deny(arg_opt()),
            "queue" => Self::Queue {
                clear: args.eq_ignore_ascii_case("clear"),
            },
            "retry" => Self::Retry,
            "history" => Self::History,
            "skills" => Self::Skills,
            "skill" => Self::Skill(arg_opt()),
            "settings" => Self::Settings,
            "debug" => Self::Debug,
            "version" => Self::Version,
            other => Self::Unknown(other.to_string()),
        };
        Some(command)
    }
}

/// Resolve `selector` against a list of names: a 1-based number, an exact
/// name, or a unique case-insensitive prefix.
pub(crate) fn resolve_selector(selector: &str, names: &[&str]) -> Option<usize> {
    let selector = selector.trim();
    if let Ok(n) = selector.parse::<usize>() {
        return (1..=names.len()).contains(&n).then(|| n - 1);
    }
    if let Some(idx) = names
        .iter()
        .position(|name| name.eq_ignore_ascii_case(selector))
    {
        return Some(idx);
    }
    let lower = selector.to_lowercase();
    let mut matches = names
        .iter()
        .enumerate()
        .filter(|(_, name)| name.to_lowercase().starts_with(&lower));
    let first = matches.next()?;
    matches.next().is_none().then_some(first.0)
}

/// True when a reply plausibly answers a pending selection dialog: pure
/// digits, or a single short token.
pub(crate) fn looks_like_selection(text: &str) -> bool {
    let token = text.trim();
    if token.is_empty() || token.len() > 32 {
        return false;
    }
    !token.contains(char::is_whitespace)
}

/// Help text listing the command grammar.
pub(crate) const HELP_TEXT: &str = "\
Commands:
/status: session and queue status
/workspaces, /workspace [n|name]: list or select a workspace
/addworkspace <name> [path], /removeworkspace <name>
/providers, /provider [n|name]: list or select a provider
/models, /model [n|name]: list or select a model
/cancel: cancel the running task
/newtask: detach this chat from its task
/approve [id], /deny [id]: answer a pending approval
/queue [clear]: engine queue status
/retry: resend the last prompt
/history: recent messages in this chat
/skills, /skill <name>: available skills
/pair <code>: redeem a pairing code
/shell <command>: run a shell task
/settings, /debug, /version";

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn non_command_text_is_none() {
        assert!(Command::parse("hello world").is_none());
        assert!(Command::parse("  plain text").is_none());
    }

    #[test]
    fn basic_commands() {
        assert_eq!(Command::parse("/start").unwrap(), Command::Start);
        assert_eq!(Command::parse("/help").unwrap(), Command::Help);
        assert_eq!(Command::parse("/cancel").unwrap(), Command::Cancel);
        assert_eq!(Command::parse("/newtask").unwrap(), Command::NewTask);
        assert_eq!(Command::parse("/version").unwrap(), Command::Version);
    }

    #[test]
    fn mention_suffix_is_stripped() {
        assert_eq!(Command::parse("/start@my_bot").unwrap(), Command::Start);
    }

    #[test]
    fn selectors_and_args() {
        assert_eq!(
            Command::parse("/workspace 2").unwrap(),
            Command::Workspace(Some("2".into()))
        );
        assert_eq!(Command::parse("/workspace").unwrap(), Command::Workspace(None));
        assert_eq!(
            Command::parse("/pair AB12CD").unwrap(),
            Command::Pair(Some("AB12CD".into()))
        );
        assert_eq!(
            Command::parse("/addworkspace web /srv/web").unwrap(),
            Command::AddWorkspace {
                name: "web".into(),
                path: Some("/srv/web".into()),
            }
        );
        assert_eq!(
            Command::parse("/shell ls -la").unwrap(),
            Command::Shell("ls -la".into())
        );
    }

    #[test]
    fn approval_aliases() {
        assert_eq!(Command::parse("/approve").unwrap(), Command::Approve(None));
        assert_eq!(
            Command::parse("/yes abc123").unwrap(),
            Command::Approve(Some("abc123".into()))
        );
        assert_eq!(Command::parse("/y").unwrap(), Command::Approve(None));
        assert_eq!(
            Command::parse("/no abc").unwrap(),
            Command::Deny(Some("abc".into()))
        );
        assert_eq!(Command::parse("/n").unwrap(), Command::Deny(None));
    }

    #[test]
    fn queue_clear() {
        assert_eq!(Command::parse("/queue").unwrap(), Command::Queue { clear: false });
        assert_eq!(
            Command::parse("/queue clear").unwrap(),
            Command::Queue { clear: true }
        );
    }

    #[test]
    fn unknown_command_never_fails() {
        assert_eq!(
            Command::parse("/frobnicate now").unwrap(),
            Command::Unknown("frobnicate".into())
        );
        assert_eq!(Command::parse("/").unwrap(), Command::Unknown(String::new()));
    }

    #[test]
    fn selector_by_number_name_and_prefix() {
        let names = ["Website", "backend", "docs"];
        assert_eq!(resolve_selector("2", &names), Some(1));
        assert_eq!(resolve_selector("0", &names), None);
        assert_eq!(resolve_selector("4", &names), None);
        assert_eq!(resolve_selector("BACKEND", &names), Some(1));
        assert_eq!(resolve_selector("doc", &names), Some(2));
        // Ambiguous prefixes resolve to nothing.
        let ambiguous = ["alpha", "alps"];
        assert_eq!(resolve_selector("al", &ambiguous), None);
        assert_eq!(resolve_selector("alph", &ambiguous), Some(0));
    }

    #[test]
    fn selection_shape() {
        assert!(looks_like_selection("2"));
        assert!(looks_like_selection("backend"));
        assert!(!looks_like_selection("build me a report"));
        assert!(!looks_like_selection(""));
    }
}
