use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::ops::Deref;
use thiserror::Error;

const SERVER_ID_MAX_LENGTH: usize = 64;

/// Unique identifier of a server within a fleet.
///
/// At most 64 characters, ASCII alphanumerics, dashes and underscores only,
/// starting with an alphanumeric. The format keeps ids safe to embed in
/// thread names and log lines.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Hash, Eq)]
#[serde(try_from = "String")]
pub struct ServerId(String);

#[derive(Error, Debug, PartialEq)]
#[error(
    "server name must be non-empty, at most {SERVER_ID_MAX_LENGTH} characters, contain only \
     alphanumerics, dashes or underscores, and start with an alphanumeric"
)]
pub struct ServerIdError;

impl ServerId {
    pub fn new(s: &str) -> Result<Self, ServerIdError> {
        Self::try_from(s.to_string())
    }

    pub fn get(&self) -> &str {
        &self.0
    }

    fn is_valid_format(s: &str) -> bool {
        !s.is_empty()
            && s.len() <= SERVER_ID_MAX_LENGTH
            && s.starts_with(|c: char| c.is_ascii_alphanumeric())
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }
}

impl TryFrom<String> for ServerId {
    type Error = ServerIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if ServerId::is_valid_format(&s) {
            Ok(ServerId(s))
        } else {
            Err(ServerIdError)
        }
    }
}

impl Deref for ServerId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::simple("everything-server")]
    #[case::underscores("file_system")]
    #[case::digit_start("7zip-helper")]
    #[case::single_char("a")]
    fn accepts_valid_names(#[case] name: &str) {
        assert_eq!(ServerId::new(name).unwrap().get(), name);
    }

    #[rstest]
    #[case::empty("")]
    #[case::leading_dash("-server")]
    #[case::spaces("my server")]
    #[case::dots("srv.local")]
    #[case::too_long("abcdefghij-abcdefghij-abcdefghij-abcdefghij-abcdefghij-abcdefghij")]
    fn rejects_invalid_names(#[case] name: &str) {
        assert_eq!(ServerId::new(name), Err(ServerIdError));
    }

    #[test]
    fn deserialises_through_validation() {
        let id: ServerId = serde_yaml::from_str("good-name").unwrap();
        assert_eq!(id.get(), "good-name");

        let err = serde_yaml::from_str::<ServerId>("\"bad name\"").unwrap_err();
        assert!(err.to_string().contains("server name"));
    }
}
