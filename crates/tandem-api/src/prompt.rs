//! Conversation assembly: persisted history rows become provider-neutral
//! turns, later shaped per backend by the dispatchers.

use tandem_store::{MediaKind, StoredMessage};

/// Role of one assembled turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

/// Media resolved for the final turn.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaPart {
    /// Base64 JPEG, attached inline on both backends.
    InlinePhoto { data: String },
    /// Handle returned by the Google upload service. Only the Google shape
    /// can reference it; the OpenAI shape omits it.
    FileHandle { mime_type: String, uri: String },
}

/// Assembled request, ready for a dispatcher.
///
/// `pinned_key` is set when the prompt references an uploaded file: the
/// upload is bound to the key that created it, so every dispatch attempt
/// must reuse that key instead of rotating.
#[derive(Debug, Clone, Default)]
pub struct Prompt {
    pub system: Option<String>,
    pub turns: Vec<Turn>,
    pub media: Option<MediaPart>,
    pub pinned_key: Option<String>,
}

impl Prompt {
    pub fn plain_text(&self) -> String {
        let mut out = String::new();
        if let Some(system) = &self.system {
            out.push_str(system);
            out.push('\n');
        }
        for turn in &self.turns {
            out.push_str(&turn.text);
            out.push('\n');
        }
        out
    }
}

/// Flags read from chat config that shape assembly.
#[derive(Debug, Clone, Copy)]
pub struct PromptOptions {
    pub add_reply_to: bool,
    pub add_system_messages: bool,
    /// OpenAI only: restate the trigger message in a final clarification pair.
    pub clarify_target_message: bool,
}

/// Assistant half of the clarification pair appended when
/// `clarify_target_message` is on.
pub const CLARIFY_ASSISTANT_TEXT: &str =
    "Understood. Which message should I reply to?";

/// Render one history row as a single prompt line.
///
/// Bot rows get `You: `; user rows get `Name: ` or `Name (username): ` when
/// the two differ. A quoted-reply segment is inserted when `add_reply_to`
/// is on. Empty bodies fall back to a media placeholder.
pub fn render_message(msg: &StoredMessage, add_reply_to: bool) -> String {
    let mut out = String::new();

    if msg.is_assistant() {
        out.push_str("You: ");
    } else if !msg.is_system() {
        let name = msg.sender_name.as_deref().unwrap_or("");
        let username = msg.sender_username.as_deref().unwrap_or("");
        if username.is_empty() || username == name {
            out.push_str(&format!("{name}: "));
        } else {
            out.push_str(&format!("{name} ({username}): "));
        }
    }

    if add_reply_to {
        if let Some(quoted) = &msg.reply_to_message_trimmed_text {
            out.push_str(&format!("[> {quoted}] "));
        }
    }

    match msg.text.as_deref() {
        Some(text) if !text.is_empty() => out.push_str(text),
        _ => out.push_str(match msg.media_kind() {
            Some(MediaKind::Photo) => "[photo.jpg]",
            Some(MediaKind::Other) => "[miscellaneous_file]",
            None => "*No text*",
        }),
    }

    out
}

fn role_of(msg: &StoredMessage) -> Role {
    if msg.is_assistant() {
        Role::Assistant
    } else if msg.is_system() {
        Role::System
    } else {
        Role::User
    }
}

/// Fold the history window into turns, newline-joining consecutive rows of
/// the same role. System rows are dropped when `add_system_messages` is off.
pub fn group_turns(history: &[StoredMessage], opts: &PromptOptions) -> Vec<Turn> {
    let mut turns: Vec<Turn> = Vec::new();

    for msg in history {
        let role = role_of(msg);
        if role == Role::System && !opts.add_system_messages {
            continue;
        }
        // Assistant and system rows carry their body raw; only user rows
        // keep the name prefix.
        let line = match role {
            Role::User => render_message(msg, opts.add_reply_to),
            _ => match msg.text.as_deref() {
                Some(t) if !t.is_empty() => t.to_string(),
                _ => "*No text*".to_string(),
            },
        };

        match turns.last_mut() {
            Some(last) if last.role == role => {
                last.text.push('\n');
                last.text.push_str(&line);
            }
            _ => turns.push(Turn { role, text: line }),
        }
    }

    ensure_user_terminal(&mut turns);
    turns
}

/// The model always receives a user-terminated context: when the last turn
/// is not a user turn, a copy of the most recent user turn is appended.
fn ensure_user_terminal(turns: &mut Vec<Turn>) {
    if matches!(turns.last(), Some(t) if t.role != Role::User) {
        if let Some(last_user) = turns.iter().rev().find(|t| t.role == Role::User).cloned() {
            turns.push(last_user);
        }
    }
}

/// Substitute `{chat_type}` / `{chat_title}` in the system prompt template.
pub fn render_system_prompt(template: &str, chat_type: &str, chat_title: &str) -> String {
    template
        .replace("{chat_type}", chat_type)
        .replace("{chat_title}", chat_title)
}

/// Collect in-band system directives (sender 727 rows) under a
/// `<behaviour_rules>` wrapper for backends that take a single system slot.
pub fn behaviour_rules(history: &[StoredMessage]) -> Option<String> {
    let rules: Vec<&str> = history
        .iter()
        .filter(|m| m.is_system() && !m.deleted)
        .filter_map(|m| m.text.as_deref())
        .filter(|t| !t.is_empty())
        .collect();
    if rules.is_empty() {
        return None;
    }
    Some(format!(
        "<behaviour_rules>\n{}\n</behaviour_rules>",
        rules.join("\n")
    ))
}

/// Append the OpenAI-only clarification pair: a synthetic assistant turn and
/// a user turn restating the freshly-rendered trigger message.
pub fn append_clarification(turns: &mut Vec<Turn>, trigger: &StoredMessage, add_reply_to: bool) {
    turns.push(Turn {
        role: Role::Assistant,
        text: CLARIFY_ASSISTANT_TEXT.to_string(),
    });
    turns.push(Turn {
        role: Role::User,
        text: render_message(trigger, add_reply_to),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_store::StoredMessage;

    fn row(id: i64, sender_id: i64, name: &str, username: &str, text: &str) -> StoredMessage {
        StoredMessage {
            umid: id as i32,
            chat_id: 1,
            message_id: id,
            timestamp: chrono::NaiveDateTime::default(),
            sender_id,
            sender_username: Some(username.to_string()),
            sender_name: Some(name.to_string()),
            text: Some(text.to_string()),
            reply_to_message_id: None,
            reply_to_message_trimmed_text: None,
            media_file_id: None,
            media_type: None,
            deleted: false,
        }
    }

    fn opts() -> PromptOptions {
        PromptOptions {
            add_reply_to: false,
            add_system_messages: true,
            clarify_target_message: false,
        }
    }

    #[test]
    fn renders_user_with_matching_username_once() {
        let msg = row(1, 10, "Alice", "Alice", "hello");
        assert_eq!(render_message(&msg, false), "Alice: hello");
    }

    #[test]
    fn renders_user_with_distinct_username() {
        let msg = row(1, 10, "Alice", "wonder", "hello");
        assert_eq!(render_message(&msg, false), "Alice (wonder): hello");
    }

    #[test]
    fn renders_bot_prefix() {
        let msg = row(1, 0, "You", "You", "hi there");
        assert_eq!(render_message(&msg, false), "You: hi there");
    }

    #[test]
    fn renders_reply_quote_when_enabled() {
        let mut msg = row(1, 10, "Alice", "Alice", "sure");
        msg.reply_to_message_trimmed_text = Some("what time?".to_string());
        assert_eq!(render_message(&msg, true), "Alice: [> what time?] sure");
        assert_eq!(render_message(&msg, false), "Alice: sure");
    }

    #[test]
    fn empty_text_falls_back_by_media_type() {
        let mut msg = row(1, 10, "Alice", "Alice", "");
        assert_eq!(render_message(&msg, false), "Alice: *No text*");
        msg.media_file_id = Some("f".to_string());
        msg.media_type = Some("photo".to_string());
        assert_eq!(render_message(&msg, false), "Alice: [photo.jpg]");
        msg.media_type = Some("other".to_string());
        assert_eq!(render_message(&msg, false), "Alice: [miscellaneous_file]");
    }

    #[test]
    fn groups_simple_conversation() {
        // user "hello", assistant "hi", user "what time?" — three turns,
        // last role user.
        let history = vec![
            row(1, 10, "Name", "Name", "hello"),
            row(2, 0, "You", "You", "hi"),
            row(3, 10, "Name", "Name", "what time?"),
        ];
        let turns = group_turns(&history, &opts());
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[0].text, "Name: hello");
        assert_eq!(turns[1].role, Role::Assistant);
        assert_eq!(turns[1].text, "hi");
        assert_eq!(turns[2].role, Role::User);
        assert_eq!(turns[2].text, "Name: what time?");
    }

    #[test]
    fn folds_consecutive_user_rows() {
        let history = vec![
            row(1, 10, "A", "A", "one"),
            row(2, 11, "B", "B", "two"),
            row(3, 0, "You", "You", "reply"),
            row(4, 10, "A", "A", "three"),
        ];
        let turns = group_turns(&history, &opts());
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].text, "A: one\nB: two");
    }

    #[test]
    fn assistant_terminal_gets_user_copy() {
        let history = vec![
            row(1, 10, "A", "A", "question"),
            row(2, 0, "You", "You", "answer"),
        ];
        let turns = group_turns(&history, &opts());
        assert_eq!(turns.len(), 3);
        assert_eq!(turns.last().unwrap().role, Role::User);
        assert_eq!(turns.last().unwrap().text, "A: question");
    }

    #[test]
    fn system_rows_dropped_when_disabled() {
        let history = vec![
            row(1, 10, "A", "A", "question"),
            row(2, 727, "SYSTEM", "SYSTEM", "be brief"),
        ];
        let mut o = opts();
        o.add_system_messages = false;
        let turns = group_turns(&history, &o);
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].role, Role::User);
    }

    #[test]
    fn system_rows_kept_when_enabled() {
        let history = vec![
            row(1, 727, "SYSTEM", "SYSTEM", "be brief"),
            row(2, 10, "A", "A", "question"),
        ];
        let turns = group_turns(&history, &opts());
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, Role::System);
        assert_eq!(turns[0].text, "be brief");
    }

    #[test]
    fn behaviour_rules_wraps_system_rows() {
        let history = vec![
            row(1, 727, "SYSTEM", "SYSTEM", "rule one"),
            row(2, 10, "A", "A", "question"),
            row(3, 727, "SYSTEM", "SYSTEM", "rule two"),
        ];
        assert_eq!(
            behaviour_rules(&history).unwrap(),
            "<behaviour_rules>\nrule one\nrule two\n</behaviour_rules>"
        );
        assert!(behaviour_rules(&history[1..2]).is_none());
    }

    #[test]
    fn system_template_substitution() {
        let rendered = render_system_prompt(
            "You are in a {chat_type}{chat_title}.",
            "group",
            " called Tea Club",
        );
        assert_eq!(rendered, "You are in a group called Tea Club.");
    }

    #[test]
    fn clarification_pair_ends_with_user_trigger() {
        let mut turns = vec![Turn {
            role: Role::User,
            text: "A: question".to_string(),
        }];
        let trigger = row(9, 10, "A", "A", "question");
        append_clarification(&mut turns, &trigger, false);
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[1].role, Role::Assistant);
        assert_eq!(turns.last().unwrap().role, Role::User);
        assert_eq!(turns.last().unwrap().text, "A: question");
    }
}
