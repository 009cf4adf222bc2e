use heapless::Vec;

use super::ContextType;
use crate::{CodecError, ContentControlId, MAX_CCIDS, METADATA_LEN};

/// Metadata LTV types.
pub mod ltv_type {
    pub const PREFERRED_AUDIO_CONTEXTS: u8 = 0x01;
    pub const STREAMING_AUDIO_CONTEXTS: u8 = 0x02;
    /// Title and/or summary of Audio Stream content: UTF-8 format
    pub const PROGRAM_INFO: u8 = 0x03;
    /// 3-byte, lower case language code as defined in ISO 639-3
    pub const LANGUAGE: u8 = 0x04;
    pub const CCID_LIST: u8 = 0x05;
}

/// The metadata this crate composes for Enable and Update Metadata
/// operations: the streaming contexts plus the content control ids that
/// produce them.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamMetadata {
    pub streaming_contexts: ContextType,
    pub ccids: Vec<ContentControlId, MAX_CCIDS>,
}

impl StreamMetadata {
    pub fn new(streaming_contexts: ContextType, ccids: &[ContentControlId]) -> Self {
        let mut list = Vec::new();
        for ccid in ccids.iter().take(MAX_CCIDS) {
            let _ = list.push(*ccid);
        }
        Self {
            streaming_contexts,
            ccids: list,
        }
    }

    /// Serialize as metadata LTVs. The CCID list is omitted when empty.
    pub fn to_ltv(&self) -> Vec<u8, METADATA_LEN> {
        let mut out = Vec::new();
        let contexts = self.streaming_contexts.bits().to_le_bytes();
        let _ = out.extend_from_slice(&[
            0x03,
            ltv_type::STREAMING_AUDIO_CONTEXTS,
            contexts[0],
            contexts[1],
        ]);
        if !self.ccids.is_empty() {
            let _ = out.push(1 + self.ccids.len() as u8);
            let _ = out.push(ltv_type::CCID_LIST);
            let _ = out.extend_from_slice(&self.ccids);
        }
        out
    }

    /// Parse from metadata LTVs, keeping only the types this crate consumes.
    pub fn from_ltv(data: &[u8]) -> Result<Self, CodecError> {
        let mut meta = StreamMetadata::default();
        let mut rest = data;
        while !rest.is_empty() {
            let len = rest[0] as usize;
            if len == 0 || rest.len() < 1 + len {
                return Err(CodecError::Truncated);
            }
            let ltv = &rest[1..1 + len];
            match (ltv[0], len - 1) {
                (ltv_type::STREAMING_AUDIO_CONTEXTS, 2) => {
                    let raw = u16::from_le_bytes([ltv[1], ltv[2]]);
                    meta.streaming_contexts =
                        ContextType::from_bits(raw).ok_or(CodecError::InvalidValue)?;
                }
                (ltv_type::CCID_LIST, _) => {
                    for ccid in &ltv[1..] {
                        if meta.ccids.push(*ccid).is_err() {
                            break;
                        }
                    }
                }
                _ => {}
            }
            rest = &rest[1 + len..];
        }
        Ok(meta)
    }
}
