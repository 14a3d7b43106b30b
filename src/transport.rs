use futures::stream::{self, Stream};
use std::time::Duration;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tracing::{debug, info};

use crate::{
    error::{DirconError, Result},
    protocol::{body_length, Packet, HEADER_SIZE},
    types::SessionConfig,
};

/// Open the TCP connection to a device
///
/// # Errors
///
/// Returns [`DirconError::Timeout`] if the connection is not established
/// within `connect_timeout_ms` and [`DirconError::ConnectionFailed`] if it is
/// refused or unreachable.
pub async fn connect(config: &SessionConfig) -> Result<TcpStream> {
    let address = config.address();
    info!("Opening TCP connection to {}", address);

    let stream = timeout(
        Duration::from_millis(config.connect_timeout_ms),
        TcpStream::connect((config.host.as_str(), config.port)),
    )
    .await
    .map_err(|_| DirconError::Timeout {
        timeout_ms: config.connect_timeout_ms,
    })?
    .map_err(|e| DirconError::ConnectionFailed {
        address: address.clone(),
        reason: e.to_string(),
    })?;

    stream.set_nodelay(true)?;
    debug!("TCP connection to {} opened", address);
    Ok(stream)
}

/// Read one packet
///
/// A connection that ends inside the header produces
/// [`Packet::unexpected_error`] so the caller handles it like any other
/// failed response.
///
/// # Errors
///
/// Returns [`DirconError::Io`] on socket errors, including a connection that
/// ends inside the body.
pub async fn read_packet<R>(reader: &mut R) -> Result<Packet>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        let read = reader.read(&mut header[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    if filled < HEADER_SIZE {
        return Ok(Packet::parse(&header[..filled], &[]));
    }

    let mut body = vec![0u8; body_length(&header)];
    reader.read_exact(&mut body).await?;
    debug!("Received header: {:02X?}, body: {:02X?}", header, body);

    Ok(Packet::parse(&header, &body))
}

/// Serialize and send one packet
///
/// # Errors
///
/// Returns serialization errors from [`Packet::to_bytes`] and
/// [`DirconError::Io`] on socket errors.
pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = packet.to_bytes()?;
    debug!("Sending packet: {:02X?}", bytes);

    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Turn the read half of a connection into a stream of packets
///
/// The stream ends after the first socket error.
pub fn packet_stream<R>(reader: R) -> impl Stream<Item = Result<Packet>>
where
    R: AsyncRead + Unpin,
{
    stream::unfold(Some(reader), |state| async move {
        let mut reader = state?;
        match read_packet(&mut reader).await {
            Ok(packet) => Some((Ok(packet), Some(reader))),
            Err(e) => Some((Err(e), None)),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{expand_uuid, MessageId, ResponseCode};
    use bytes::Bytes;
    use futures::StreamExt;
    use tokio_test::io::Builder;

    fn notification(uuid: u32, payload: &[u8]) -> Vec<u8> {
        let len = u8::try_from(16 + payload.len()).unwrap();
        let mut bytes = vec![0x01, 0x06, 0x00, 0x00, 0x00, len];
        bytes.extend_from_slice(expand_uuid(uuid).as_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    #[tokio::test]
    async fn test_read_packet_across_partial_reads() {
        let bytes = notification(0x2ACD, &[0x00, 0x00, 0x64, 0x00]);
        let mut reader = Builder::new()
            .read(&bytes[..3])
            .read(&bytes[3..10])
            .read(&bytes[10..])
            .build();

        let packet = read_packet(&mut reader).await.unwrap();

        assert_eq!(packet.message_id, MessageId::UnsolicitedNotification);
        assert_eq!(packet.uuid(), Some(0x2ACD));
        assert_eq!(&packet.payload[..], &[0x00, 0x00, 0x64, 0x00]);
    }

    #[tokio::test]
    async fn test_closed_connection_yields_error_packet() {
        let mut reader = Builder::new().read(&[0x01, 0x06]).build();

        let packet = read_packet(&mut reader).await.unwrap();

        assert_eq!(packet.message_id, MessageId::Error);
        assert_eq!(packet.response_code, ResponseCode::UnexpectedError);
    }

    #[tokio::test]
    async fn test_truncated_body_is_an_io_error() {
        let mut reader = Builder::new()
            .read(&[0x01, 0x03, 0x01, 0x00, 0x00, 0x14])
            .read(&[0x00, 0x00, 0x2A])
            .build();

        let result = read_packet(&mut reader).await;
        assert!(matches!(result, Err(DirconError::Io(_))));
    }

    #[tokio::test]
    async fn test_write_packet() {
        let packet = Packet::write_characteristic(3, 0x2AD9, Bytes::from_static(&[0x02, 0xCE, 0x04]));
        let expected = packet.to_bytes().unwrap();
        let mut writer = Builder::new().write(&expected).build();

        write_packet(&mut writer, &packet).await.unwrap();
    }

    #[tokio::test]
    async fn test_packet_stream() {
        let mut bytes = notification(0x2ACD, &[0x00, 0x00, 0x64, 0x00]);
        bytes.extend(notification(0x2A53, &[0x00, 0x00, 0x05, 0x50]));
        let reader = Builder::new().read(&bytes).build();

        let packets: Vec<_> = packet_stream(reader).take(3).collect().await;

        assert_eq!(packets[0].as_ref().unwrap().uuid(), Some(0x2ACD));
        assert_eq!(packets[1].as_ref().unwrap().uuid(), Some(0x2A53));
        assert!(!packets[2].as_ref().unwrap().is_success());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = connect(&SessionConfig::new("127.0.0.1", port)).await;
        assert!(matches!(result, Err(DirconError::ConnectionFailed { .. })));
    }
}
