//! Transport encoding of image attachments.
//!
//! The generation service takes images as standard base64 strings. Encodings are derived
//! from the stored bytes on every request and never cached.

use anywhere_storage::Attachment;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CodecError {
    #[snafu(display("attachment payload is not valid base64 on `{stage}`: {source}"))]
    Decode {
        stage: &'static str,
        source: base64::DecodeError,
    },
}

pub type CodecResult<T> = Result<T, CodecError>;

pub fn encode(attachment: &Attachment) -> String {
    STANDARD.encode(&attachment.bytes)
}

pub fn encode_all(attachments: &[Attachment]) -> Vec<String> {
    attachments.iter().map(encode).collect()
}

pub fn decode(transport: &str) -> CodecResult<Vec<u8>> {
    STANDARD.decode(transport).context(DecodeSnafu {
        stage: "attachment-decode",
    })
}
