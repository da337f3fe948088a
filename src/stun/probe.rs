//! STUN Binding 探测
//!
//! 在调用方持有的 socket 上做一次 Binding 请求/响应，
//! 解析 XOR-MAPPED-ADDRESS 得到公网映射地址。
//! socket 的所有权始终归调用方：同一个本地端口
//! 之后还要被监听器复用，探测器绝不能关闭它

use bytecodec::{DecodeExt, EncodeExt};
use std::io;
use std::net::{IpAddr, SocketAddr};
use stun_codec::rfc5389::attributes::XorMappedAddress;
use stun_codec::rfc5389::methods::BINDING;
use stun_codec::rfc5389::Attribute;
use stun_codec::{Message, MessageClass, MessageDecoder, MessageEncoder, TransactionId};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{timeout, timeout_at, Instant};

use super::READ_TIMEOUT;

/// STUN 探测错误
#[derive(Debug, Error)]
pub enum StunError {
    #[error("stun server unreachable: {0}")]
    Unreachable(#[from] io::Error),

    #[error("malformed stun response")]
    Malformed,

    #[error("stun response missing XOR-MAPPED-ADDRESS")]
    MissingAttr,
}

/// 构造一条带新事务 ID 的 Binding 请求
pub fn build_binding_request() -> Result<Vec<u8>, StunError> {
    let transaction_id = TransactionId::new(rand::random());
    let message = Message::<Attribute>::new(MessageClass::Request, BINDING, transaction_id);

    MessageEncoder::new()
        .encode_into_bytes(message)
        .map_err(|_| StunError::Malformed)
}

/// 从响应字节中解出公网映射地址
pub(crate) fn decode_mapped_address(raw: &[u8]) -> Result<(IpAddr, u16), StunError> {
    let mut decoder = MessageDecoder::<Attribute>::new();
    let message = decoder
        .decode_from_bytes(raw)
        .map_err(|_| StunError::Malformed)?
        .map_err(|_| StunError::Malformed)?;

    for attr in message.attributes() {
        if let Attribute::XorMappedAddress(xor_addr) = attr {
            let addr: SocketAddr = xor_addr.address();
            return Ok((addr.ip(), addr.port()));
        }
    }

    Err(StunError::MissingAttr)
}

/// 在一条已建立的 TCP 连接上做 STUN 握手
pub async fn probe_tcp(conn: &mut TcpStream) -> Result<(IpAddr, u16), StunError> {
    let request = build_binding_request()?;
    conn.write_all(&request).await?;

    let mut buf = [0u8; 1024];
    let n = timeout(READ_TIMEOUT, conn.read(&mut buf))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "读取 STUN 响应超时"))??;
    if n == 0 {
        return Err(StunError::Unreachable(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "STUN 连接被对端关闭",
        )));
    }

    decode_mapped_address(&buf[..n])
}

/// 在一个 UDP socket 上向指定服务器做 STUN 握手
pub async fn probe_udp(
    socket: &UdpSocket,
    server_addr: SocketAddr,
) -> Result<(IpAddr, u16), StunError> {
    let request = build_binding_request()?;
    socket.send_to(&request, server_addr).await?;

    // 整个等待共用一个截止时刻；
    // 其他对端的数据报只被过滤，不重置剩余等待时间
    let deadline = Instant::now() + READ_TIMEOUT;
    let mut buf = [0u8; 1024];
    let n = loop {
        let (n, from) = timeout_at(deadline, socket.recv_from(&mut buf))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "读取 UDP STUN 响应超时"))??;
        if from == server_addr {
            break n;
        }
    };

    decode_mapped_address(&buf[..n])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_request_shape() {
        let raw = build_binding_request().unwrap();
        // STUN 头固定 20 字节: type(2) + length(2) + magic cookie(4) + transaction id(12)
        assert_eq!(raw.len(), 20);
        // Binding Request 的消息类型是 0x0001
        assert_eq!(&raw[0..2], &[0x00, 0x01]);
        // magic cookie
        assert_eq!(&raw[4..8], &[0x21, 0x12, 0xA4, 0x42]);
    }

    #[test]
    fn test_fresh_transaction_id() {
        let a = build_binding_request().unwrap();
        let b = build_binding_request().unwrap();
        assert_ne!(&a[8..20], &b[8..20]);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode_mapped_address(&[0u8; 8]),
            Err(StunError::Malformed)
        ));
    }

    #[test]
    fn test_decode_missing_attr() {
        // 一条合法但不带任何属性的 Binding 成功响应
        let transaction_id = TransactionId::new([7u8; 12]);
        let message =
            Message::<Attribute>::new(MessageClass::SuccessResponse, BINDING, transaction_id);
        let raw = MessageEncoder::new().encode_into_bytes(message).unwrap();

        assert!(matches!(
            decode_mapped_address(&raw),
            Err(StunError::MissingAttr)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_probe_udp_deadline_not_reset_by_stray_datagrams() {
        use std::time::Duration;

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let probe_addr = socket.local_addr().unwrap();
        // 一个从不回应的 "STUN 服务器"
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        // 无关对端持续往探测 socket 灌包
        let flooder = tokio::spawn(async move {
            let noise = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            loop {
                let _ = noise.send_to(b"noise", probe_addr).await;
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        });

        let start = std::time::Instant::now();
        let result = probe_udp(&socket, server_addr).await;
        flooder.abort();

        assert!(matches!(result, Err(StunError::Unreachable(_))));
        // 杂包不能把 3s 截止时刻往后推
        assert!(start.elapsed() < Duration::from_secs(6));
    }

    #[test]
    fn test_decode_xor_mapped_address() {
        let transaction_id = TransactionId::new([7u8; 12]);
        let mut message =
            Message::<Attribute>::new(MessageClass::SuccessResponse, BINDING, transaction_id);
        let mapped: SocketAddr = "203.0.113.7:41234".parse().unwrap();
        message.add_attribute(Attribute::XorMappedAddress(XorMappedAddress::new(mapped)));
        let raw = MessageEncoder::new().encode_into_bytes(message).unwrap();

        let (ip, port) = decode_mapped_address(&raw).unwrap();
        assert_eq!(ip, mapped.ip());
        assert_eq!(port, 41234);
    }
}
