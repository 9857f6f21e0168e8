// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Transport payloads delivered to pager threads
//! OWNERS: @kernel-ipc-team
//! PUBLIC API: MessageTag, RawMessage, PagerMessage, ProtocolError
//! INVARIANTS: Tags are pairwise distinct; decode never guesses an unknown tag
//!
//! Every payload carries a tag word. The pager decodes the tag before it
//! interprets anything else, so a page-fault record is never mistaken for an
//! exception or a wakeup request.

use thiserror_no_std::Error;

use super::{ExceptionInfo, FaultAccess, Pagefault};
use crate::thread::ThreadId;
use crate::types::VirtAddr;

/// Payload words following the tag.
pub const MESSAGE_WORDS: usize = 4;

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTag {
    PageFault = 1,
    Exception = 2,
    Wakeup = 3,
}

static_assertions::const_assert_ne!(MessageTag::PageFault as u16, MessageTag::Exception as u16);
static_assertions::const_assert_ne!(MessageTag::PageFault as u16, MessageTag::Wakeup as u16);
static_assertions::const_assert_ne!(MessageTag::Exception as u16, MessageTag::Wakeup as u16);

impl MessageTag {
    pub const fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(Self::PageFault),
            2 => Some(Self::Exception),
            3 => Some(Self::Wakeup),
            _ => None,
        }
    }
}

/// Message as it sits in a pager's inbox.
///
/// Word 0 names the thread the message is about for every tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawMessage {
    pub tag: u16,
    pub words: [u64; MESSAGE_WORDS],
}

impl RawMessage {
    /// Thread the message is about, readable without decoding the tag.
    pub fn subject(&self) -> ThreadId {
        ThreadId::from_raw(self.words[0])
    }
}

#[must_use = "protocol errors terminate the receiving pager"]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unknown message tag {0}")]
    UnknownTag(u16),
    #[error("invalid fault access code {0}")]
    BadAccess(u64),
}

/// Decoded pager message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagerMessage {
    PageFault(Pagefault),
    Exception(ExceptionInfo),
    Wakeup { target: ThreadId },
}

impl PagerMessage {
    pub fn tag(&self) -> MessageTag {
        match self {
            Self::PageFault(_) => MessageTag::PageFault,
            Self::Exception(_) => MessageTag::Exception,
            Self::Wakeup { .. } => MessageTag::Wakeup,
        }
    }

    /// Thread the message is about.
    pub fn subject(&self) -> ThreadId {
        match self {
            Self::PageFault(fault) => fault.faulter,
            Self::Exception(info) => info.thread,
            Self::Wakeup { target } => *target,
        }
    }

    pub fn encode(&self) -> RawMessage {
        let words = match self {
            Self::PageFault(fault) => [
                fault.faulter.to_raw(),
                fault.addr.raw() as u64,
                fault.ip.raw() as u64,
                fault.access as u64,
            ],
            Self::Exception(info) => {
                [info.thread.to_raw(), info.ip.raw() as u64, info.vector as u64, 0]
            }
            Self::Wakeup { target } => [target.to_raw(), 0, 0, 0],
        };
        RawMessage { tag: self.tag() as u16, words }
    }

    pub fn decode(raw: &RawMessage) -> Result<Self, ProtocolError> {
        let tag = MessageTag::from_raw(raw.tag).ok_or(ProtocolError::UnknownTag(raw.tag))?;
        let [subject, a, b, c] = raw.words;
        let subject = ThreadId::from_raw(subject);
        Ok(match tag {
            MessageTag::PageFault => Self::PageFault(Pagefault {
                faulter: subject,
                addr: VirtAddr::new(a as usize),
                ip: VirtAddr::new(b as usize),
                access: FaultAccess::from_raw(c).ok_or(ProtocolError::BadAccess(c))?,
            }),
            MessageTag::Exception => Self::Exception(ExceptionInfo {
                thread: subject,
                ip: VirtAddr::new(a as usize),
                vector: b as usize,
            }),
            MessageTag::Wakeup => Self::Wakeup { target: subject },
        })
    }
}
