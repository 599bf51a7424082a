//! Static description of every chat parameter: type, default, accepted
//! values, visibility flags. The config table is migrated against this
//! schema on startup; `/settings`, `/set` and presets all read it.

use std::fmt;

/// Storage type of a parameter column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Text,
    Integer,
    Decimal,
    Boolean,
}

impl ParamKind {
    /// SQL column type used in DDL.
    pub fn sql_type(self) -> &'static str {
        match self {
            ParamKind::Text => "text",
            ParamKind::Integer => "integer",
            ParamKind::Decimal => "double precision",
            ParamKind::Boolean => "boolean",
        }
    }
}

/// Which endpoint group a parameter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamGroup {
    Common,
    Google,
    OpenAi,
}

/// Value constraint for `/set`.
#[derive(Debug, Clone, Copy)]
pub enum Accepted {
    /// Anything of the right type.
    Free,
    /// Exact or unique-prefix match against this list.
    Enum(&'static [&'static str]),
    /// Half-open integer range `[start, stop)`.
    IntRange(i64, i64),
    /// Closed decimal range `[min, max]`.
    DecRange(f64, f64),
}

/// A typed runtime value read from or written to the config table.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Text(String),
    Integer(i64),
    Decimal(f64),
    Boolean(bool),
    Null,
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Text(s) => write!(f, "{s}"),
            ParamValue::Integer(i) => write!(f, "{i}"),
            ParamValue::Decimal(d) => write!(f, "{d}"),
            ParamValue::Boolean(b) => write!(f, "{b}"),
            ParamValue::Null => write!(f, "unset"),
        }
    }
}

impl ParamValue {
    /// Render as a SQL literal for DDL default clauses. Runtime writes go
    /// through bound parameters; this is only used during migration against
    /// values taken from the static schema.
    pub fn sql_literal(&self) -> String {
        match self {
            ParamValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
            ParamValue::Integer(i) => i.to_string(),
            ParamValue::Decimal(d) => d.to_string(),
            ParamValue::Boolean(b) => b.to_string(),
            ParamValue::Null => "NULL".to_string(),
        }
    }
}

/// One parameter of the chat config schema.
pub struct ParamSpec {
    pub name: &'static str,
    pub group: ParamGroup,
    pub kind: ParamKind,
    pub default: ParamValue,
    pub accepted: Accepted,
    /// Writable only by global administrators.
    pub protected: bool,
    /// Displayed obfuscated; set flow detours through a DM.
    pub private: bool,
    /// Hidden from the short `/settings` listing.
    pub advanced: bool,
    pub description: &'static str,
}

/// Why a `/set` was rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum SetRejection {
    WrongType,
    OutOfRange,
    /// No accepted value matches; carries the closest suggestion, if any.
    NoMatch(Option<&'static str>),
    /// The prefix matches more than one accepted value.
    Ambiguous(Vec<&'static str>),
}

macro_rules! t {
    ($s:expr) => {
        ParamValue::Text($s.to_string())
    };
}

/// The full parameter schema: the `common` group plus one group per backend.
pub fn chat_config_schema() -> &'static [ParamSpec] {
    use Accepted::*;
    use ParamGroup::*;
    use ParamKind::*;

    static SCHEMA: std::sync::OnceLock<Vec<ParamSpec>> = std::sync::OnceLock::new();
    SCHEMA.get_or_init(|| {
        vec![
            ParamSpec {
                name: "endpoint",
                group: Common,
                kind: Text,
                default: t!("google"),
                accepted: Enum(&["google", "openai"]),
                protected: false,
                private: false,
                advanced: false,
                description: "Which backend generates replies",
            },
            ParamSpec {
                name: "message_limit",
                group: Common,
                kind: Integer,
                default: ParamValue::Integer(50),
                accepted: IntRange(1, 2500),
                protected: false,
                private: false,
                advanced: false,
                description: "Maximum messages kept in the bot's memory window",
            },
            ParamSpec {
                name: "memory_alter_permission",
                group: Common,
                kind: Text,
                default: t!("all"),
                accepted: Enum(&["all", "admins", "owner"]),
                protected: false,
                private: false,
                advanced: false,
                description: "Who may use /reset, /forget and related memory commands",
            },
            ParamSpec {
                name: "show_advanced_settings",
                group: Common,
                kind: Boolean,
                default: ParamValue::Boolean(false),
                accepted: Free,
                protected: false,
                private: false,
                advanced: false,
                description: "Show advanced parameters in /settings (still reachable via /set)",
            },
            ParamSpec {
                name: "process_markdown",
                group: Common,
                kind: Boolean,
                default: ParamValue::Boolean(true),
                accepted: Free,
                protected: false,
                private: false,
                advanced: true,
                description: "Let Telegram render Markdown formatting in replies",
            },
            ParamSpec {
                name: "show_error_messages",
                group: Common,
                kind: Boolean,
                default: ParamValue::Boolean(true),
                accepted: Free,
                protected: false,
                private: false,
                advanced: true,
                description: "Show detailed error messages",
            },
            ParamSpec {
                name: "add_reply_to",
                group: Common,
                kind: Boolean,
                default: ParamValue::Boolean(false),
                accepted: Free,
                protected: false,
                private: false,
                advanced: true,
                description: "Prefix messages with the quoted reply target so the model sees who answers whom",
            },
            ParamSpec {
                name: "token_limit",
                group: Common,
                kind: Integer,
                default: ParamValue::Integer(0),
                accepted: IntRange(0, 127_990),
                protected: false,
                private: false,
                advanced: true,
                description: "Soft cap on conversation tokens; 0 disables the limit",
            },
            ParamSpec {
                name: "token_limit_action",
                group: Common,
                kind: Text,
                default: t!("warn"),
                accepted: Enum(&["warn", "block"]),
                protected: false,
                private: false,
                advanced: true,
                description: "What to do when the token limit is exceeded",
            },
            ParamSpec {
                name: "max_output_tokens",
                group: Common,
                kind: Integer,
                default: ParamValue::Integer(1024),
                accepted: IntRange(0, 65_536),
                protected: false,
                private: false,
                advanced: true,
                description: "Longest reply the model may generate",
            },
            ParamSpec {
                name: "media_context_max_depth",
                group: Common,
                kind: Integer,
                default: ParamValue::Integer(5),
                accepted: IntRange(1, 20),
                protected: false,
                private: false,
                advanced: true,
                description: "How many reply-chain hops to scan for media files",
            },
            ParamSpec {
                name: "max_requests_per_hour",
                group: Common,
                kind: Integer,
                default: ParamValue::Integer(80),
                accepted: IntRange(0, 1200),
                protected: true,
                private: false,
                advanced: false,
                description: "Hourly request cap for this chat; raised only by bot administrators",
            },
            // Google group
            ParamSpec {
                name: "g_model",
                group: Google,
                kind: Text,
                default: t!("gemini-1.5-pro-latest"),
                accepted: Free,
                protected: false,
                private: false,
                advanced: false,
                description: "Gemini model used by the bot",
            },
            ParamSpec {
                name: "g_safety_threshold",
                group: Google,
                kind: Text,
                default: t!("none"),
                accepted: Enum(&["none", "only_high", "medium_and_above", "low_and_above"]),
                protected: false,
                private: false,
                advanced: false,
                description: "Confidence level at which unsafe content blocks the reply",
            },
            ParamSpec {
                name: "g_temperature",
                group: Google,
                kind: Decimal,
                default: ParamValue::Decimal(1.0),
                accepted: DecRange(0.0, 2.0),
                protected: false,
                private: false,
                advanced: true,
                description: "Sampling temperature; higher values give more random replies",
            },
            ParamSpec {
                name: "g_top_p",
                group: Google,
                kind: Decimal,
                default: ParamValue::Decimal(0.95),
                accepted: DecRange(0.0, 1.0),
                protected: false,
                private: false,
                advanced: true,
                description: "Nucleus sampling probability threshold",
            },
            ParamSpec {
                name: "g_top_k",
                group: Google,
                kind: Integer,
                default: ParamValue::Integer(40),
                accepted: IntRange(1, 100),
                protected: false,
                private: false,
                advanced: true,
                description: "Number of highest-probability tokens considered at each step",
            },
            ParamSpec {
                name: "g_code_execution",
                group: Google,
                kind: Boolean,
                default: ParamValue::Boolean(false),
                accepted: Free,
                protected: false,
                private: false,
                advanced: false,
                description: "Allow the model to run Python in a sandboxed container",
            },
            ParamSpec {
                name: "g_web_search",
                group: Google,
                kind: Boolean,
                default: ParamValue::Boolean(false),
                accepted: Free,
                protected: false,
                private: false,
                advanced: false,
                description: "Allow the Gemini API to ground replies with web search",
            },
            ParamSpec {
                name: "g_web_threshold",
                group: Google,
                kind: Decimal,
                default: ParamValue::Decimal(0.73),
                accepted: DecRange(0.0, 1.0),
                protected: false,
                private: false,
                advanced: true,
                description: "How readily the model verifies itself through web search",
            },
            ParamSpec {
                name: "g_web_show_queries",
                group: Google,
                kind: Boolean,
                default: ParamValue::Boolean(true),
                accepted: Free,
                protected: false,
                private: false,
                advanced: true,
                description: "Append the search queries used for grounding to the reply",
            },
            ParamSpec {
                name: "g_web_show_sources",
                group: Google,
                kind: Boolean,
                default: ParamValue::Boolean(true),
                accepted: Free,
                protected: false,
                private: false,
                advanced: true,
                description: "Append grounding source links to the reply",
            },
            ParamSpec {
                name: "g_show_thinking",
                group: Google,
                kind: Boolean,
                default: ParamValue::Boolean(false),
                accepted: Free,
                protected: false,
                private: false,
                advanced: true,
                description: "Include the reasoning part of thinking models above the reply",
            },
            // OpenAI-compatible group
            ParamSpec {
                name: "o_url",
                group: OpenAi,
                kind: Text,
                default: ParamValue::Null,
                accepted: Free,
                protected: false,
                private: true,
                advanced: false,
                description: "Endpoint base URL, without /v1/chat/completions; unset uses the default endpoint",
            },
            ParamSpec {
                name: "o_key",
                group: OpenAi,
                kind: Text,
                default: ParamValue::Null,
                accepted: Free,
                protected: false,
                private: true,
                advanced: false,
                description: "Authorization key for the endpoint configured in o_url",
            },
            ParamSpec {
                name: "o_model",
                group: OpenAi,
                kind: Text,
                default: t!("gpt-4o"),
                accepted: Free,
                protected: false,
                private: false,
                advanced: false,
                description: "Model used by the bot",
            },
            ParamSpec {
                name: "o_auto_fallback",
                group: OpenAi,
                kind: Boolean,
                default: ParamValue::Boolean(true),
                accepted: Free,
                protected: false,
                private: false,
                advanced: false,
                description: "Automatically fall back to the Gemini API when the OpenAI endpoint fails",
            },
            ParamSpec {
                name: "o_add_system_prompt",
                group: OpenAi,
                kind: Boolean,
                default: ParamValue::Boolean(true),
                accepted: Free,
                protected: false,
                private: false,
                advanced: true,
                description: "Prepend the built-in system prompt",
            },
            ParamSpec {
                name: "o_add_system_messages",
                group: OpenAi,
                kind: Boolean,
                default: ParamValue::Boolean(true),
                accepted: Free,
                protected: false,
                private: false,
                advanced: true,
                description: "Include system messages in context; off hides both the built-in prompt and /system rows",
            },
            ParamSpec {
                name: "o_clarify_target_message",
                group: OpenAi,
                kind: Boolean,
                default: ParamValue::Boolean(true),
                accepted: Free,
                protected: false,
                private: false,
                advanced: true,
                description: "Append a clarification turn so the model knows which message to answer",
            },
            ParamSpec {
                name: "o_vision",
                group: OpenAi,
                kind: Boolean,
                default: ParamValue::Boolean(true),
                accepted: Free,
                protected: false,
                private: false,
                advanced: false,
                description: "Allow the model to receive images",
            },
            ParamSpec {
                name: "o_timeout",
                group: OpenAi,
                kind: Integer,
                default: ParamValue::Integer(60),
                accepted: IntRange(1, 300),
                protected: false,
                private: false,
                advanced: true,
                description: "Maximum seconds to wait for the OpenAI endpoint",
            },
            ParamSpec {
                name: "o_temperature",
                group: OpenAi,
                kind: Decimal,
                default: ParamValue::Decimal(1.0),
                accepted: DecRange(0.0, 2.0),
                protected: false,
                private: false,
                advanced: true,
                description: "Sampling temperature; higher values give more random replies",
            },
            ParamSpec {
                name: "o_top_p",
                group: OpenAi,
                kind: Decimal,
                default: ParamValue::Decimal(1.0),
                accepted: DecRange(0.0, 1.0),
                protected: false,
                private: false,
                advanced: true,
                description: "Nucleus sampling probability threshold",
            },
            ParamSpec {
                name: "o_presence_penalty",
                group: OpenAi,
                kind: Decimal,
                default: ParamValue::Decimal(0.0),
                accepted: DecRange(-2.0, 2.0),
                protected: false,
                private: false,
                advanced: true,
                description: "Penalty for revisiting topics; positive values encourage new ones",
            },
            ParamSpec {
                name: "o_frequency_penalty",
                group: OpenAi,
                kind: Decimal,
                default: ParamValue::Decimal(0.0),
                accepted: DecRange(-2.0, 2.0),
                protected: false,
                private: false,
                advanced: true,
                description: "Penalty for repeating the same phrases",
            },
            ParamSpec {
                name: "o_log_prompt",
                group: OpenAi,
                kind: Boolean,
                default: ParamValue::Boolean(false),
                accepted: Free,
                protected: true,
                private: false,
                advanced: true,
                description: "Write assembled prompts to the bot log for debugging",
            },
        ]
    })
}

/// Look up a parameter by exact name.
pub fn param(name: &str) -> Option<&'static ParamSpec> {
    chat_config_schema().iter().find(|p| p.name == name)
}

/// Named bags of `(param, raw value)` pairs applied atomically by `/preset`.
pub fn presets() -> &'static [(&'static str, &'static [(&'static str, &'static str)])] {
    &[
        (
            "default",
            &[
                ("max_output_tokens", "1024"),
                ("o_model", "gpt-4o"),
                ("g_model", "gemini-1.5-pro-latest"),
                ("o_add_system_prompt", "true"),
                ("o_add_system_messages", "true"),
                ("o_timeout", "60"),
                ("o_vision", "true"),
                ("o_clarify_target_message", "true"),
            ],
        ),
        (
            "o1",
            &[
                ("endpoint", "openai"),
                ("max_output_tokens", "32768"),
                ("o_model", "o1-preview"),
                ("o_vision", "false"),
                ("o_timeout", "300"),
                ("o_add_system_messages", "false"),
                ("o_clarify_target_message", "false"),
            ],
        ),
    ]
}

/// Validate `raw` against `spec`, canonicalising enum prefixes.
///
/// Enumerable parameters accept an exact match or a unique prefix; an
/// ambiguous prefix is rejected with the candidates, and no match carries
/// the closest suggestion.
pub fn validate(spec: &ParamSpec, raw: &str) -> Result<ParamValue, SetRejection> {
    let raw = raw.trim();
    match spec.kind {
        ParamKind::Boolean => match raw.to_lowercase().as_str() {
            "true" => Ok(ParamValue::Boolean(true)),
            "false" => Ok(ParamValue::Boolean(false)),
            _ => Err(SetRejection::WrongType),
        },
        ParamKind::Integer => {
            let v: i64 = raw.parse().map_err(|_| SetRejection::WrongType)?;
            match spec.accepted {
                Accepted::IntRange(start, stop) if v < start || v >= stop => {
                    Err(SetRejection::OutOfRange)
                }
                _ => Ok(ParamValue::Integer(v)),
            }
        }
        ParamKind::Decimal => {
            let v: f64 = raw.parse().map_err(|_| SetRejection::WrongType)?;
            match spec.accepted {
                Accepted::DecRange(min, max) if v < min || v > max => {
                    Err(SetRejection::OutOfRange)
                }
                _ => Ok(ParamValue::Decimal(v)),
            }
        }
        ParamKind::Text => {
            let lowered = raw.to_lowercase();
            match spec.accepted {
                Accepted::Enum(options) => {
                    if let Some(exact) = options.iter().find(|o| **o == lowered) {
                        return Ok(ParamValue::Text(exact.to_string()));
                    }
                    let matches: Vec<&'static str> = options
                        .iter()
                        .copied()
                        .filter(|o| o.starts_with(&lowered))
                        .collect();
                    match matches.len() {
                        1 => Ok(ParamValue::Text(matches[0].to_string())),
                        0 => Err(SetRejection::NoMatch(closest(options, &lowered))),
                        _ => Err(SetRejection::Ambiguous(matches)),
                    }
                }
                _ => Ok(ParamValue::Text(raw.to_string())),
            }
        }
    }
}

/// Closest suggestion: the option sharing the longest common prefix with the
/// input, ties broken by list order.
fn closest(options: &'static [&'static str], input: &str) -> Option<&'static str> {
    options
        .iter()
        .copied()
        .max_by_key(|o| common_prefix_len(o, input))
        .filter(|o| common_prefix_len(o, input) > 0)
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.bytes().zip(b.bytes()).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_names_are_unique() {
        let mut names: Vec<&str> = chat_config_schema().iter().map(|p| p.name).collect();
        let before = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), before);
    }

    #[test]
    fn enum_exact_match() {
        let spec = param("endpoint").unwrap();
        assert_eq!(
            validate(spec, "google").unwrap(),
            ParamValue::Text("google".to_string())
        );
    }

    #[test]
    fn enum_unique_prefix_is_canonicalised() {
        let spec = param("endpoint").unwrap();
        assert_eq!(
            validate(spec, "goo").unwrap(),
            ParamValue::Text("google".to_string())
        );
    }

    #[test]
    fn enum_ambiguous_prefix_rejected() {
        let spec = param("memory_alter_permission").unwrap();
        match validate(spec, "a").unwrap_err() {
            SetRejection::Ambiguous(opts) => assert_eq!(opts, vec!["all", "admins"]),
            other => panic!("expected Ambiguous, got {other:?}"),
        }
    }

    #[test]
    fn enum_no_match_suggests_closest() {
        let spec = param("memory_alter_permission").unwrap();
        match validate(spec, "admnis").unwrap_err() {
            SetRejection::NoMatch(Some(s)) => assert_eq!(s, "admins"),
            other => panic!("expected suggestion, got {other:?}"),
        }
    }

    #[test]
    fn int_range_is_half_open() {
        let spec = param("message_limit").unwrap();
        assert!(validate(spec, "1").is_ok());
        assert!(validate(spec, "2499").is_ok());
        assert_eq!(validate(spec, "2500").unwrap_err(), SetRejection::OutOfRange);
        assert_eq!(validate(spec, "0").unwrap_err(), SetRejection::OutOfRange);
    }

    #[test]
    fn decimal_range_is_closed() {
        let spec = param("g_temperature").unwrap();
        assert!(validate(spec, "0").is_ok());
        assert!(validate(spec, "2.0").is_ok());
        assert_eq!(
            validate(spec, "2.01").unwrap_err(),
            SetRejection::OutOfRange
        );
    }

    #[test]
    fn boolean_requires_literal() {
        let spec = param("process_markdown").unwrap();
        assert_eq!(
            validate(spec, "TRUE").unwrap(),
            ParamValue::Boolean(true)
        );
        assert_eq!(validate(spec, "1").unwrap_err(), SetRejection::WrongType);
    }

    #[test]
    fn free_text_passes_through_untouched() {
        let spec = param("g_model").unwrap();
        assert_eq!(
            validate(spec, "Gemini-Exp-1206").unwrap(),
            ParamValue::Text("Gemini-Exp-1206".to_string())
        );
    }

    #[test]
    fn presets_reference_known_parameters() {
        for (_, pairs) in presets() {
            for (name, raw) in *pairs {
                let spec = param(name).unwrap_or_else(|| panic!("unknown preset param {name}"));
                assert!(validate(spec, raw).is_ok(), "invalid preset value for {name}");
            }
        }
    }
}
