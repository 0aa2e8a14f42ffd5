//! Derivation of wire-level event and consumer names
//!
//! Names are pure functions of the type name, the configured options and an
//! optional override supplied through the registration builder. Deriving the
//! same inputs twice always yields the same string, and outputs only ever
//! contain `[A-Za-z0-9]` plus the convention separator.

use serde::Deserialize;

/// Separator applied when joining the words of a derived name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum NamingConvention {
    /// Words joined by `-`
    KebabCase,
    /// Words joined by `_`
    SnakeCase,
    /// Words joined by `.`
    DotCase,
}

impl NamingConvention {
    /// Separator character of the convention
    pub fn separator(self) -> char {
        match self {
            NamingConvention::KebabCase => '-',
            NamingConvention::SnakeCase => '_',
            NamingConvention::DotCase => '.',
        }
    }
}

/// Source of the consumer-name stem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ConsumerNameSource {
    /// Derived from the consumer type alone
    TypeName,
    /// The configured prefix alone
    Prefix,
    /// The configured prefix followed by the type-derived name
    PrefixAndTypeName,
}

/// Options governing how event and consumer names are derived
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NamingOptions {
    /// Optional prefix put in front of every event name
    pub scope: Option<String>,

    /// Casing convention for derived names
    pub convention: NamingConvention,

    /// Whether the fully qualified type path participates in the name
    pub use_full_type_names: bool,

    /// How the consumer-name stem is chosen
    pub consumer_name_source: ConsumerNameSource,

    /// Prefix for consumer names; the application name is used when absent
    pub consumer_name_prefix: Option<String>,

    /// Whether the event name is appended to the consumer name
    pub suffix_consumer_name: bool,
}

impl Default for NamingOptions {
    fn default() -> Self {
        Self {
            scope: None,
            convention: NamingConvention::KebabCase,
            use_full_type_names: false,
            consumer_name_source: ConsumerNameSource::TypeName,
            consumer_name_prefix: None,
            suffix_consumer_name: false,
        }
    }
}

/// Derives the wire name of an event type
///
/// An override replaces the whole derivation and is only sanitized, never
/// re-cased or scoped — it is taken as the author's literal intent.
pub fn derive_event_name(
    options: &NamingOptions,
    type_name: &str,
    override_name: Option<&str>,
) -> String {
    let separator = options.convention.separator();

    if let Some(name) = override_name {
        return sanitize(name, separator);
    }

    let mut name = render(&words(&type_token(type_name, options.use_full_type_names)), separator);

    if let Some(scope) = options.scope.as_deref() {
        name = format!("{}{}{}", scope, separator, name);
    }

    sanitize(&name, separator)
}

/// Derives the wire name of a consumer type under a given event
pub fn derive_consumer_name(
    options: &NamingOptions,
    type_name: &str,
    override_name: Option<&str>,
    event_name: &str,
    application_name: &str,
) -> String {
    let separator = options.convention.separator();

    let mut name = match override_name {
        Some(name) => name.to_owned(),
        None => {
            let derived = render(&words(&type_token(type_name, options.use_full_type_names)), separator);
            let prefix = options
                .consumer_name_prefix
                .as_deref()
                .unwrap_or(application_name);

            match options.consumer_name_source {
                ConsumerNameSource::TypeName => derived,
                ConsumerNameSource::Prefix => prefix.to_owned(),
                ConsumerNameSource::PrefixAndTypeName => {
                    format!("{}{}{}", prefix, separator, derived)
                }
            }
        }
    };

    if options.suffix_consumer_name {
        name = format!("{}{}{}", name, separator, event_name);
    }

    sanitize(&name, separator)
}

/// Reduces a type name to the raw token the pipeline starts from
///
/// Generic arguments never participate in a name; neither does the module
/// path unless full type names are requested, in which case path separators
/// behave like any other word boundary.
fn type_token(type_name: &str, full: bool) -> String {
    let stripped = type_name.split('<').next().unwrap_or(type_name);

    if full {
        stripped.to_owned()
    } else {
        stripped
            .rsplit("::")
            .next()
            .unwrap_or(stripped)
            .to_owned()
    }
}

/// Splits a token into lowercase words on separators and case boundaries
///
/// Acronym runs stay together (`HTTPServer` becomes `http` + `server`) and
/// digits attach to the word they follow.
fn words(token: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let chars: Vec<char> = token.chars().collect();

    for (index, &c) in chars.iter().enumerate() {
        if matches!(c, '.' | ':' | '_' | '-' | ' ') {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            continue;
        }

        let boundary = if current.is_empty() {
            false
        } else if c.is_uppercase() {
            let previous = chars[index - 1];
            let next_lower = chars.get(index + 1).map(|n| n.is_lowercase()).unwrap_or(false);

            previous.is_lowercase() || previous.is_ascii_digit() || (previous.is_uppercase() && next_lower)
        } else {
            false
        };

        if boundary {
            words.push(std::mem::take(&mut current));
        }

        current.extend(c.to_lowercase());
    }

    if !current.is_empty() {
        words.push(current);
    }

    words
}

fn render(words: &[String], separator: char) -> String {
    words.join(&separator.to_string())
}

/// Replaces characters outside `[A-Za-z0-9]` and the separator, then
/// collapses separator repeats and trims the ends
fn sanitize(raw: &str, separator: char) -> String {
    let replaced: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == separator {
                c
            } else {
                separator
            }
        })
        .collect();

    let mut collapsed = String::with_capacity(replaced.len());
    for c in replaced.chars() {
        if c == separator && collapsed.ends_with(separator) {
            continue;
        }
        collapsed.push(c);
    }

    collapsed
        .trim_matches(separator)
        .to_owned()
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;

    fn scoped_kebab() -> NamingOptions {
        NamingOptions {
            scope: Some("dev".into()),
            ..NamingOptions::default()
        }
    }

    #[test]
    fn derive_scoped_short_names() {
        let name = derive_event_name(&scoped_kebab(), "acme_app::events::TestEvent1", None);
        assert_eq!(name, "dev-test-event1");
    }

    #[test]
    fn derive_scoped_full_names() {
        let options = NamingOptions {
            use_full_type_names: true,
            ..scoped_kebab()
        };

        let name = derive_event_name(&options, "acme_app::events::TestEvent1", None);
        assert_eq!(name, "dev-acme-app-events-test-event1");
    }

    #[test]
    fn take_overrides_literally() {
        for convention in [
            NamingConvention::KebabCase,
            NamingConvention::SnakeCase,
            NamingConvention::DotCase,
        ] {
            let options = NamingOptions {
                convention,
                ..scoped_kebab()
            };

            let name = derive_event_name(&options, "acme_app::events::DoorOpened", Some("sample-event"));
            assert_eq!(name, "sample-event");
        }
    }

    #[test]
    fn sanitize_overrides() {
        let name = derive_event_name(
            &NamingOptions::default(),
            "acme_app::events::DoorOpened",
            Some("door//opened!!v2"),
        );
        assert_eq!(name, "door-opened-v2");
    }

    #[test]
    fn respect_each_convention() {
        let type_name = "acme_app::events::TestEvent1";

        let snake = NamingOptions {
            convention: NamingConvention::SnakeCase,
            ..NamingOptions::default()
        };
        let dot = NamingOptions {
            convention: NamingConvention::DotCase,
            ..NamingOptions::default()
        };

        assert_eq!(derive_event_name(&snake, type_name, None), "test_event1");
        assert_eq!(derive_event_name(&dot, type_name, None), "test.event1");
    }

    #[test]
    fn strip_generic_arguments() {
        let name = derive_event_name(
            &NamingOptions::default(),
            "acme_app::events::Wrapped<acme_app::events::Inner>",
            None,
        );
        assert_eq!(name, "wrapped");
    }

    #[test]
    fn keep_acronym_runs_together() {
        let name = derive_event_name(&NamingOptions::default(), "acme_app::HTTPServerStarted", None);
        assert_eq!(name, "http-server-started");
    }

    #[test]
    fn combine_prefix_type_name_and_suffix() {
        let options = NamingOptions {
            consumer_name_source: ConsumerNameSource::PrefixAndTypeName,
            consumer_name_prefix: Some("service1".into()),
            suffix_consumer_name: true,
            ..NamingOptions::default()
        };

        let name = derive_consumer_name(
            &options,
            "acme_app::consumers::TestConsumer1",
            None,
            "test-event1",
            "fallback-app",
        );
        assert_eq!(name, "service1-test-consumer1-test-event1");
    }

    #[test]
    fn fall_back_to_the_application_name() {
        let options = NamingOptions {
            consumer_name_source: ConsumerNameSource::Prefix,
            ..NamingOptions::default()
        };

        let name = derive_consumer_name(
            &options,
            "acme_app::consumers::TestConsumer1",
            None,
            "test-event1",
            "checkout",
        );
        assert_eq!(name, "checkout");
    }

    #[test]
    fn derive_names_idempotently() {
        let options = NamingOptions {
            use_full_type_names: true,
            ..scoped_kebab()
        };

        let first = derive_event_name(&options, "acme_app::events::TestEvent1", None);
        let second = derive_event_name(&options, "acme_app::events::TestEvent1", None);
        assert_eq!(first, second);
    }

    #[test]
    fn never_emit_invalid_characters() {
        let options = NamingOptions {
            scope: Some("weird scope!".into()),
            use_full_type_names: true,
            ..NamingOptions::default()
        };

        let name = derive_event_name(&options, "acme_app::events::Ünicode::Mess<Bad>", None);

        assert!(name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-'));
        assert!(!name.contains("--"));
        assert!(!name.starts_with('-') && !name.ends_with('-'));
    }
}
