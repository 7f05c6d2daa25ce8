//! Topic Names and Topic Filters.
//!
//! https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_Toc3901241

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Returns `true` if `filter` matches the Topic Name `name`.
///
/// `filter` is assumed to be valid (see [`Filter`]), an invalid filter gives an unspecified answer.
///
/// `+` matches exactly one non-empty level, `#` matches any number of trailing levels (including
/// none, so `a/#` matches `a`). Neither wildcard matches a name starting with `$` when it appears
/// in the first level.
pub fn matches(filter: &str, name: &str) -> bool {
    let system = name.starts_with('$');

    if filter == "#" {
        return !system;
    }

    let mut names = name.split('/');

    for (idx, level) in filter.split('/').enumerate() {
        match level {
            "#" => return idx > 0 || !system,
            "+" => match names.next() {
                Some(name) if !name.is_empty() && (idx > 0 || !system) => (),
                _ => return false,
            },
            literal => {
                if names.next() != Some(literal) {
                    return false;
                }
            }
        }
    }

    names.next().is_none()
}

/// A valid Topic Filter.
///
/// A filter is non-empty, `+` and `#` only appear as an entire level, `#` only as the last level,
/// and it contains no null characters.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Filter(String);

impl Filter {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn levels(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }
}

impl FromStr for Filter {
    type Err = FilterParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(FilterParseError::EmptyFilter);
        }

        let mut seen_hash = false;

        for token in s.split('/') {
            // we have another level after a `#`
            if seen_hash {
                return Err(FilterParseError::InvalidWildcard);
            }

            match token {
                "+" => (),
                "#" => seen_hash = true,
                _ => {
                    if let Some((idx, ch)) = token
                        .char_indices()
                        .find(|it| matches!(it.1, '#' | '+' | '\0'))
                    {
                        return Err(FilterParseError::InvalidToken {
                            token: token.to_owned(),
                            pos: idx,
                            ch,
                        });
                    }
                }
            }
        }

        Ok(Self(s.to_owned()))
    }
}

impl Display for Filter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum FilterParseError {
    /// Filter must not be empty.
    #[error("filter must not be empty")]
    EmptyFilter,

    /// `token` contains an invalid character (`ch`) at `pos`.
    #[error("{token} contains an invalid character starting at {pos} (`{ch}`)")]
    InvalidToken { token: String, pos: usize, ch: char },

    /// Found a `#` wildcard and it wasn't the end of the filter.
    #[error("filter contains a `#` wildcard that isn't trailing")]
    InvalidWildcard,
}

/// A valid Topic Name.
///
/// A Topic Name must not be zero-length, nor may it contain wildcard characters or a null byte (`\0`).
///
/// A Topic Name in a `PUBLISH` packet _may_ be empty if a Topic Alias is used, but Topic Aliases
/// aren't supported so that is rejected here too.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TopicName<'a>(&'a str);

impl<'a> TopicName<'a> {
    pub fn parse(s: &'a str) -> Result<Self, TopicParseError> {
        if s.is_empty() {
            return Err(TopicParseError::TopicEmpty);
        }

        if let Some((idx, ch)) = s.char_indices().find(|it| matches!(it.1, '#' | '+' | '\0')) {
            return Err(TopicParseError::UnexpectedCharacter { ch, idx });
        }

        Ok(Self(s))
    }

    pub fn as_str(&self) -> &'a str {
        self.0
    }

    /// System topics start with `$` and are never matched by a wildcard in the first level.
    pub fn is_system(&self) -> bool {
        self.0.starts_with('$')
    }
}

impl Display for TopicName<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum TopicParseError {
    /// Found an unexpected character `ch` at `idx`.
    #[error("unexpected character `{ch}` at {idx}")]
    UnexpectedCharacter { ch: char, idx: usize },
    #[error("topic name cannot be empty")]
    TopicEmpty,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_table() {
        let matching = [
            ("#", "/"),
            ("#", "word"),
            ("#", "a/b"),
            ("a/#", "a/b"),
            ("a/#", "a"),
            ("a/+/#", "a/b/c"),
            ("a/+/#", "a/b"),
            ("a/+/+", "a/b/c"),
            ("word", "word"),
            ("$sys", "$sys"),
            ("a/b", "a/b"),
        ];

        for (filter, name) in matching {
            assert!(matches(filter, name), "{filter:?} should match {name:?}");
        }

        let not_matching = [
            ("#", "$sys"),
            ("+", "$sys"),
            ("a/b/+/#", "a/b"),
            ("b/+/#", "a/b/c"),
            ("a/+/+", "a/b/c/d"),
            ("a/+/+", "b/c/d"),
            ("a/+/+", "a/b"),
            ("a/B", "a/b"),
            ("/a", "a"),
            ("a", "/a"),
        ];

        for (filter, name) in not_matching {
            assert!(!matches(filter, name), "{filter:?} should not match {name:?}");
        }
    }

    #[test]
    fn system_topics() {
        assert!(matches("$SYS/#", "$SYS/broker/load"));
        assert!(matches("$SYS/+/load", "$SYS/broker/load"));
        assert!(!matches("+/broker/load", "$SYS/broker/load"));
        assert!(!matches("#", "$"));
    }

    #[test]
    fn empty_levels() {
        assert!(!matches("a", ""));
        assert!(!matches("+", ""));
        assert!(!matches("a/+", "a/"));
        assert!(matches("a//b", "a//b"));
        assert!(matches("a/#", "a/"));
    }

    #[test]
    fn filter_parse() {
        expect_test::expect![[r#"
            Err(
                InvalidWildcard,
            )
        "#]]
        .assert_debug_eq(&"a/#/c".parse::<Filter>());

        expect_test::expect![[r#"
            Err(
                InvalidToken {
                    token: "a+",
                    pos: 1,
                    ch: '+',
                },
            )
        "#]]
        .assert_debug_eq(&"x/a+".parse::<Filter>());

        assert_eq!("".parse::<Filter>(), Err(FilterParseError::EmptyFilter));
        assert_eq!("sport/#".parse::<Filter>().map(|it| it.to_string()).as_deref(), Ok("sport/#"));
        assert!("+/+/#".parse::<Filter>().is_ok());
        assert!("/".parse::<Filter>().is_ok());
    }

    #[test]
    fn topic_name_parse() {
        assert!(TopicName::parse("a/b").is_ok());
        assert!(TopicName::parse("$SYS/x").unwrap().is_system());
        assert_eq!(TopicName::parse(""), Err(TopicParseError::TopicEmpty));

        expect_test::expect![[r#"
            Err(
                UnexpectedCharacter {
                    ch: '\0',
                    idx: 7,
                },
            )
        "#]]
        .assert_debug_eq(&TopicName::parse("foo/bar\0"));
    }
}
