//! Wire protocol between client and chunk server
//!
//! Frames are a 4-byte big-endian length followed by a bincode-encoded
//! [`Message`]. A read is answered by a stream of [`ReadData`] blocks, each
//! at most one block long and carrying its CRC-32, terminated by a single
//! [`ReadStatus`] that reports how many bytes were sent.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::chunk::{ChunkId, ChunkPart, ChunkVersion};
use crate::error::TransportError;

/// Room for headers on top of one block of payload
pub const MESSAGE_OVERHEAD: usize = 1024;

/// Largest frame accepted for a given block size
pub fn max_message_length(block_size: u32) -> usize {
    block_size as usize + MESSAGE_OVERHEAD
}

/// Messages exchanged on a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Read(ReadRequest),
    ReadData(ReadData),
    ReadStatus(ReadStatus),
}

/// Client request for a range of one part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRequest {
    pub chunk_id: ChunkId,
    pub version: ChunkVersion,
    pub part: ChunkPart,
    pub offset: u32,
    pub size: u32,
}

/// One block of reply data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadData {
    pub chunk_id: ChunkId,
    /// Offset of this block within the part
    pub offset: u32,
    pub crc: u32,
    pub data: Vec<u8>,
}

impl ReadData {
    pub fn new(chunk_id: ChunkId, offset: u32, data: Vec<u8>) -> Self {
        Self {
            chunk_id,
            offset,
            crc: crc32fast::hash(&data),
            data,
        }
    }

    pub fn crc_matches(&self) -> bool {
        crc32fast::hash(&self.data) == self.crc
    }
}

/// Outcome of a read request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    Ok,
    WrongVersion { current: ChunkVersion },
    NoSuchChunk,
    InvalidRequest(String),
    Io(String),
}

/// Terminates the reply to a read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadStatus {
    pub chunk_id: ChunkId,
    pub status: StatusCode,
    /// Payload bytes sent before this status
    pub length: u32,
}

pub fn encode(message: &Message) -> Result<Vec<u8>, TransportError> {
    let config = bincode::config::standard();
    bincode::serde::encode_to_vec(message, config).map_err(|e| TransportError::Codec(e.to_string()))
}

pub fn decode(bytes: &[u8]) -> Result<Message, TransportError> {
    let config = bincode::config::standard();
    let (message, _): (Message, usize) = bincode::serde::decode_from_slice(bytes, config)
        .map_err(|e| TransportError::Codec(e.to_string()))?;
    Ok(message)
}

/// Write one frame; returns bytes written including the length prefix
pub async fn write_frame<W>(writer: &mut W, message: &Message) -> Result<usize, TransportError>
where
    W: AsyncWrite + Unpin,
{
    let payload = encode(message)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| TransportError::Protocol("frame exceeds u32 length".into()))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(4 + payload.len())
}

/// Read one frame; `None` on a clean close at a frame boundary
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Option<Message>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        return Err(TransportError::Protocol(format!(
            "message length {len} exceeds limit {max_len}"
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    decode(&payload).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1 << 20);
        let request = Message::Read(ReadRequest {
            chunk_id: ChunkId(3),
            version: ChunkVersion(1),
            part: ChunkPart::XorData { level: 3, index: 2 },
            offset: 65536,
            size: 131072,
        });

        write_frame(&mut client, &request).await.unwrap();
        let received = read_frame(&mut server, 4096).await.unwrap();
        assert_eq!(received, Some(request));

        drop(client);
        assert_eq!(read_frame(&mut server, 4096).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1 << 20);
        let block = Message::ReadData(ReadData::new(ChunkId(1), 0, vec![0u8; 8192]));
        write_frame(&mut client, &block).await.unwrap();

        let err = read_frame(&mut server, max_message_length(4096))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }

    #[test]
    fn test_block_crc() {
        let mut block = ReadData::new(ChunkId(1), 0, b"chunk data".to_vec());
        assert!(block.crc_matches());
        block.data[0] ^= 0xFF;
        assert!(!block.crc_matches());
    }
}
