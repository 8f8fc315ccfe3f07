use std::fmt;
use std::str::FromStr;

use snafu::ResultExt;
use uuid::Uuid;

use super::error::{InvalidIdSnafu, StorageError, StorageResult};

macro_rules! define_storage_id {
    ($name:ident, $id_type:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new_v7() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn parse(raw: &str) -> StorageResult<Self> {
                let parsed = Uuid::parse_str(raw).context(InvalidIdSnafu {
                    stage: "parse-storage-id",
                    id_type: $id_type,
                    raw: raw.to_string(),
                })?;
                Ok(Self(parsed))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(formatter, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = StorageError;

            fn from_str(raw: &str) -> StorageResult<Self> {
                Self::parse(raw)
            }
        }
    };
}

define_storage_id!(SessionId, "session-id");
define_storage_id!(MessageId, "message-id");
define_storage_id!(AttachmentId, "attachment-id");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_output_parses_back() {
        let id = SessionId::new_v7();
        let parsed: SessionId = id.to_string().parse().expect("valid uuid text");
        assert_eq!(parsed, id);
    }

    #[test]
    fn malformed_id_reports_its_type() {
        let error = MessageId::parse("not-a-uuid").expect_err("must reject");
        match error {
            StorageError::InvalidId { id_type, raw, .. } => {
                assert_eq!(id_type, "message-id");
                assert_eq!(raw, "not-a-uuid");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn fresh_ids_are_distinct() {
        assert_ne!(AttachmentId::new_v7(), AttachmentId::new_v7());
    }
}
