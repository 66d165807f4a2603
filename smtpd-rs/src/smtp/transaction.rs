//! The in-flight mail transaction.
//!
//! Opened by MAIL, grown by RCPT and DATA/BDAT, destroyed by RSET or
//! committed into the queue. The body stays in memory up to a threshold and
//! spills to an anonymous spool file beyond it; either way the transaction
//! tracks the exact octet count after dot-unstuffing so SIZE can be enforced
//! while bytes arrive.

use crate::error::Result;
use crate::smtp::command::{Address, MailParams, ReversePath};
use sha2::{Digest, Sha256};
use std::io::SeekFrom;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionFlags {
    pub body_8bit: bool,
    pub smtputf8: bool,
    pub chunking: bool,
}

enum BodyBuffer {
    Memory(Vec<u8>),
    Spooled { file: File, len: u64 },
}

impl BodyBuffer {
    fn len(&self) -> u64 {
        match self {
            BodyBuffer::Memory(v) => v.len() as u64,
            BodyBuffer::Spooled { len, .. } => *len,
        }
    }
}

/// Envelope and body of one in-flight message.
pub struct Transaction {
    pub reverse_path: ReversePath,
    pub forward_paths: Vec<Address>,
    pub declared_size: Option<u64>,
    pub flags: TransactionFlags,
    body: BodyBuffer,
    spool_threshold: u64,
    body_started: bool,
}

/// A transaction after end-of-data, ready for the queue store.
pub struct CommittedMessage {
    pub message_id: String,
    pub reverse_path: String,
    pub forward_paths: Vec<String>,
    pub declared_size: Option<u64>,
    pub body: Vec<u8>,
    pub body_ref: String,
}

impl Transaction {
    pub fn open(reverse_path: ReversePath, params: &MailParams, spool_threshold: u64) -> Self {
        Self {
            reverse_path,
            forward_paths: Vec::new(),
            declared_size: params.size,
            flags: TransactionFlags {
                body_8bit: params.body_8bit,
                smtputf8: params.smtputf8,
                chunking: false,
            },
            body: BodyBuffer::Memory(Vec::new()),
            spool_threshold,
            body_started: false,
        }
    }

    pub fn add_recipient(&mut self, address: Address) {
        self.forward_paths.push(address);
    }

    pub fn recipient_count(&self) -> usize {
        self.forward_paths.len()
    }

    /// Exact body octets accumulated so far (post-unstuffing).
    pub fn body_len(&self) -> u64 {
        self.body.len()
    }

    /// The byte ceiling for this transaction: the declared SIZE when the
    /// client gave one, bounded by the configured maximum.
    pub fn effective_limit(&self, max_message_size: u64) -> u64 {
        match self.declared_size {
            Some(declared) => declared.min(max_message_size),
            None => max_message_size,
        }
    }

    /// Append one unstuffed DATA line. Lines are joined with CRLF; the
    /// terminator's own CRLF is not part of the body.
    pub async fn write_line(&mut self, line: &[u8]) -> Result<()> {
        if self.body_started {
            self.append(b"\r\n").await?;
        }
        self.body_started = true;
        self.append(line).await
    }

    /// Append raw BDAT chunk bytes verbatim.
    pub async fn write_chunk(&mut self, bytes: &[u8]) -> Result<()> {
        self.body_started = true;
        self.append(bytes).await
    }

    async fn append(&mut self, bytes: &[u8]) -> Result<()> {
        if let BodyBuffer::Memory(buf) = &mut self.body {
            if buf.len() as u64 + bytes.len() as u64 > self.spool_threshold {
                let mut file = File::from_std(tempfile::tempfile()?);
                file.write_all(buf).await?;
                let len = buf.len() as u64;
                self.body = BodyBuffer::Spooled { file, len };
            }
        }

        match &mut self.body {
            BodyBuffer::Memory(buf) => {
                buf.extend_from_slice(bytes);
            }
            BodyBuffer::Spooled { file, len } => {
                file.write_all(bytes).await?;
                *len += bytes.len() as u64;
            }
        }
        Ok(())
    }

    /// Seal the transaction: read the body back as one byte sequence,
    /// derive the content digest used as `body_ref` and mint the message id.
    pub async fn commit(self) -> Result<CommittedMessage> {
        let body = match self.body {
            BodyBuffer::Memory(buf) => buf,
            BodyBuffer::Spooled { mut file, len } => {
                file.flush().await?;
                file.seek(SeekFrom::Start(0)).await?;
                let mut buf = Vec::with_capacity(len as usize);
                file.read_to_end(&mut buf).await?;
                buf
            }
        };

        let digest = Sha256::digest(&body);
        let body_ref: String = digest.iter().map(|b| format!("{b:02x}")).collect();

        Ok(CommittedMessage {
            message_id: Uuid::new_v4().to_string(),
            reverse_path: self.reverse_path.to_string(),
            forward_paths: self.forward_paths.iter().map(|a| a.to_string()).collect(),
            declared_size: self.declared_size,
            body,
            body_ref,
        })
    }
}
