use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use super::message::{opcode, FromClient};

#[async_trait]
pub trait Deserialize: Sized {
    type Error;

    /// Read one value off the wire, consuming exactly its encoding.
    async fn deserialize<R: AsyncReadExt + Unpin + Send>(
        reader: &mut R,
    ) -> Result<Self, Self::Error>;
}

#[derive(thiserror::Error, Debug)]
pub enum DeserializeError {
    #[error("{0}")]
    Io(#[from] tokio::io::Error),

    #[error("{0}")]
    Utf(#[from] std::string::FromUtf8Error),

    #[error("unknown message type: {0:#04x}")]
    UnknownType(u8),
}

#[async_trait]
impl Deserialize for String {
    type Error = DeserializeError;

    async fn deserialize<R: AsyncReadExt + Unpin + Send>(
        reader: &mut R,
    ) -> Result<Self, Self::Error> {
        let length = reader.read_u8().await?;
        let mut raw = vec![0u8; length as usize];
        reader.read_exact(&mut raw).await?;

        Ok(String::from_utf8(raw)?)
    }
}

#[async_trait]
impl Deserialize for Vec<u16> {
    type Error = tokio::io::Error;

    async fn deserialize<R: AsyncReadExt + Unpin + Send>(
        reader: &mut R,
    ) -> Result<Self, Self::Error> {
        let count = reader.read_u8().await?;
        let mut values = Vec::with_capacity(count as usize);
        for _ in 0..count {
            values.push(reader.read_u16().await?);
        }

        Ok(values)
    }
}

#[async_trait]
impl Deserialize for FromClient {
    type Error = DeserializeError;

    async fn deserialize<R: AsyncReadExt + Unpin + Send>(
        reader: &mut R,
    ) -> Result<Self, Self::Error> {
        let ty = reader.read_u8().await?;

        let message = match ty {
            opcode::PLATE => Self::Plate {
                plate: String::deserialize(reader).await?,
                timestamp: reader.read_u32().await?,
            },
            opcode::WANT_HEARTBEAT => Self::WantHeartbeat {
                interval: reader.read_u32().await?,
            },
            opcode::I_AM_CAMERA => Self::IAmCamera {
                road: reader.read_u16().await?,
                mile: reader.read_u16().await?,
                limit: reader.read_u16().await?,
            },
            opcode::I_AM_DISPATCHER => Self::IAmDispatcher {
                roads: Vec::deserialize(reader).await?,
            },

            _ => return Err(DeserializeError::UnknownType(ty)),
        };

        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use crate::protocol::{deserializer::Deserialize, message::FromClient};

    #[tokio::test]
    async fn deserialize_primitives() {
        let raw = b"\x04\x55\x4e\x31\x58";
        let text = String::deserialize(&mut raw.as_ref()).await.unwrap();
        assert_eq!(text, "UN1X");

        let raw = b"\x00";
        let text = String::deserialize(&mut raw.as_ref()).await.unwrap();
        assert_eq!(text, "");

        let raw = b"\x03\x00\x42\x01\x70\x13\x88";
        let roads: Vec<u16> = Vec::deserialize(&mut raw.as_ref()).await.unwrap();
        assert_eq!(roads, &[66u16, 368, 5000]);
    }

    #[tokio::test]
    async fn deserialize_client_messages() {
        let raw_values: [&[u8]; 6] = [
            b"\x20\x04\x55\x4e\x31\x58\x00\x00\x03\xe8",
            b"\x20\x07\x52\x45\x30\x35\x42\x4b\x47\x00\x01\xe2\x40",
            b"\x40\x00\x00\x00\x0a",
            b"\x80\x00\x7b\x00\x08\x00\x3c",
            b"\x81\x01\x00\x7b",
            b"\x81\x03\x00\x42\x01\x70\x13\x88",
        ];

        let mut parsed = Vec::with_capacity(raw_values.len());
        for mut raw in raw_values {
            parsed.push(FromClient::deserialize(&mut raw).await.unwrap());
        }

        let expected = [
            FromClient::Plate {
                plate: "UN1X".into(),
                timestamp: 1000,
            },
            FromClient::Plate {
                plate: "RE05BKG".into(),
                timestamp: 123_456,
            },
            FromClient::WantHeartbeat { interval: 10 },
            FromClient::IAmCamera {
                road: 123,
                mile: 8,
                limit: 60,
            },
            FromClient::IAmDispatcher { roads: [123].into() },
            FromClient::IAmDispatcher {
                roads: [66, 368, 5000].into(),
            },
        ];

        assert_eq!(parsed, expected);
    }

    #[tokio::test]
    async fn unknown_opcode_is_rejected() {
        let mut raw: &[u8] = b"\x42\x00\x00";
        assert!(FromClient::deserialize(&mut raw).await.is_err());
    }

    #[tokio::test]
    async fn short_read_is_an_io_error() {
        // Plate header promising more bytes than the stream holds.
        let mut raw: &[u8] = b"\x20\x09\x55\x4e";
        let result = FromClient::deserialize(&mut raw).await;
        assert!(matches!(
            result,
            Err(super::DeserializeError::Io(_))
        ));
    }
}
