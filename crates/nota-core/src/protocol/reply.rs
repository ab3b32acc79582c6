//! Reply composition.

use serde::{Deserialize, Serialize};

use super::constants::{
    META_SEPARATOR, PROTOCOL_VERSION, REPLY_AUTH, REPLY_ERR_HASH, REPLY_ERR_PREFIX, REPLY_OK,
};

/// Layout of the metadata suffix on invitation replies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyFormat {
    /// `<proto>|/<host>|/<platform>|/<board>|/<fw_version>`
    #[default]
    Extended,
    /// `<proto>|/<host>|/<platform>`
    Legacy,
}

/// Device identity advertised to uploaders.
#[derive(Debug, Clone, Copy)]
pub struct Metadata<'a> {
    pub hostname: &'a str,
    pub platform: &'a str,
    pub board: &'a str,
    pub firmware_version: &'a str,
    pub format: ReplyFormat,
}

impl Metadata<'_> {
    pub fn render(&self) -> String {
        let mut fields = vec![PROTOCOL_VERSION, self.hostname, self.platform];
        if self.format == ReplyFormat::Extended {
            fields.push(self.board);
            fields.push(self.firmware_version);
        }
        fields.join(META_SEPARATOR)
    }
}

pub fn invitation_ok(meta: &Metadata<'_>) -> String {
    format!("{REPLY_OK} {}", meta.render())
}

pub fn invitation_auth(nonce: &str, meta: &Metadata<'_>) -> String {
    format!("{REPLY_AUTH} {nonce} {}", meta.render())
}

pub fn invitation_hash_error(meta: &Metadata<'_>) -> String {
    format!("{REPLY_ERR_HASH} {}", meta.render())
}

/// Free-text failure reply; trailing line breaks of `reason` are dropped.
pub fn failure(reason: &str) -> String {
    format!("{REPLY_ERR_PREFIX}{}", reason.trim_end_matches(['\r', '\n']))
}
