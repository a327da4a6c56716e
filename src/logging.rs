//! Tracing setup and secret redaction for anything that ends up in a log line.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

const REDACTED: &str = "[REDACTED]";

/// Field names whose values are never logged: `password`, `client_secret`,
/// `refresh_token`, `plain_text_passwd` and the like.
const SECRET_NAME: &str = r"(?:[a-z0-9]+[_-])*(?:password|passwd|pwd|secret|token)";

static SECRET_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("(?i)^{SECRET_NAME}$")).expect("invalid secret key pattern")
});

/// Applied in order to free text: form bodies, header dumps, YAML.
static SECRET_PATTERNS: LazyLock<Vec<SecretPattern>> = LazyLock::new(|| {
    vec![
        SecretPattern::new(
            "private_key",
            r"(?s)-----BEGIN [A-Z ]*PRIVATE KEY-----.*?-----END [A-Z ]*PRIVATE KEY-----",
            REDACTED,
        ),
        SecretPattern::new(
            "bearer_token",
            r"(?i)\b(bearer)(\s+)[A-Za-z0-9\-_.~+/=]+",
            "${1}${2}[REDACTED]",
        ),
        SecretPattern::new(
            "basic_auth",
            r#"(?i)(authorization"?\s*[:=]\s*"?\[?basic\s+)[A-Za-z0-9+/=]+"#,
            "${1}[REDACTED]",
        ),
        SecretPattern::new(
            "key_value",
            &format!(r#"(?i)\b({SECRET_NAME})("?\s*[:=]\s*"?)[^\s&"',;\[\]{{}}]+"#),
            "${1}${2}[REDACTED]",
        ),
    ]
});

struct SecretPattern {
    #[allow(dead_code)]
    name: &'static str,
    regex: Regex,
    replacement: &'static str,
}

impl SecretPattern {
    fn new(name: &'static str, pattern: &str, replacement: &'static str) -> Self {
        Self {
            name,
            regex: Regex::new(pattern).expect("invalid secret pattern"),
            replacement,
        }
    }
}

/// Install the global subscriber. Logs go to stderr; stdout is reserved for
/// command output. `RUST_LOG` overrides the configured level.
pub fn init(config: &LogConfig) {
    let level = if debug_forced() {
        "debug"
    } else {
        config.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    // try_init: a second call (tests, repeated commands) is a no-op
    let _ = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

fn debug_forced() -> bool {
    std::env::var("CDI_DEBUG")
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Strip credentials out of a request/response body before logging it.
///
/// JSON documents have their secret fields replaced and their string values
/// scanned; anything else goes through the pattern table.
pub fn redact(text: &str) -> Cow<'_, str> {
    match serde_json::from_str::<Value>(text) {
        Ok(mut value @ (Value::Object(_) | Value::Array(_))) => {
            redact_json(&mut value);
            Cow::Owned(value.to_string())
        }
        _ => redact_text(text),
    }
}

fn redact_json(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, v) in map.iter_mut() {
                if SECRET_KEY.is_match(key) {
                    *v = Value::String(REDACTED.into());
                } else {
                    redact_json(v);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(redact_json),
        Value::String(s) => {
            let redacted = redact_text(s).into_owned();
            *s = redacted;
        }
        _ => {}
    }
}

fn redact_text(text: &str) -> Cow<'_, str> {
    let mut result = Cow::Borrowed(text);
    for pattern in SECRET_PATTERNS.iter() {
        if pattern.regex.is_match(&result) {
            result = Cow::Owned(
                pattern
                    .regex
                    .replace_all(&result, pattern.replacement)
                    .into_owned(),
            );
        }
    }
    result
}
