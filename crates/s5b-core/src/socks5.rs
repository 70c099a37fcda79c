//! Client-side SOCKS5 handshake, used only by the health probes.
//!
//! Relay traffic is forwarded opaquely; the balancer never speaks SOCKS5 on
//! behalf of a relayed client. Probes use this to verify a backend actually
//! accepts CONNECT, not just TCP.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

fn proto_err(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

/// Negotiate method + optional RFC1929 auth, then CONNECT to `host:port`.
///
/// The target is always encoded as ATYP=domain so the backend does its own
/// resolution. Returns once the reply (including BND.ADDR) is fully consumed.
pub async fn connect_through<S>(
    stream: &mut S,
    username: Option<&str>,
    password: Option<&str>,
    host: &str,
    port: u16,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Method negotiation
    let methods: &[u8] = if username.is_some() {
        &[0x05, 0x01, 0x02] // VER=5, NMETHODS=1, USERPASS
    } else {
        &[0x05, 0x01, 0x00] // NOAUTH
    };
    stream.write_all(methods).await?;

    let mut rsp = [0u8; 2];
    stream.read_exact(&mut rsp).await?;
    if rsp[0] != 0x05 {
        return Err(proto_err("socks5: bad version"));
    }

    if rsp[1] == 0x02 {
        let u = username.unwrap_or_default();
        let p = password.unwrap_or_default();
        if u.len() > 255 || p.len() > 255 {
            return Err(proto_err("socks5: user/pass too long"));
        }
        let mut buf = Vec::with_capacity(3 + u.len() + p.len());
        buf.extend_from_slice(&[0x01, u.len() as u8]);
        buf.extend_from_slice(u.as_bytes());
        buf.push(p.len() as u8);
        buf.extend_from_slice(p.as_bytes());
        stream.write_all(&buf).await?;

        let mut vr = [0u8; 2];
        stream.read_exact(&mut vr).await?;
        if vr[1] != 0x00 {
            return Err(proto_err("socks5: auth failed"));
        }
    } else if rsp[1] != 0x00 {
        return Err(proto_err("socks5: no acceptable methods"));
    }

    // CONNECT request
    if host.len() > 255 {
        return Err(proto_err("socks5: hostname too long"));
    }
    let mut msg = Vec::with_capacity(7 + host.len());
    msg.extend_from_slice(&[0x05, 0x01, 0x00, 0x03]); // VER, CMD=CONNECT, RSV, ATYP=domain
    msg.push(host.len() as u8);
    msg.extend_from_slice(host.as_bytes());
    msg.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&msg).await?;

    // Reply header, then consume BND.ADDR
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[1] != 0x00 {
        return Err(proto_err(format!(
            "socks5: connect failed, rep={:#04x}",
            head[1]
        )));
    }
    match head[3] {
        0x01 => {
            let mut b = [0u8; 4 + 2];
            stream.read_exact(&mut b).await?;
        }
        0x03 => {
            let mut l = [0u8; 1];
            stream.read_exact(&mut l).await?;
            let mut dom = vec![0u8; l[0] as usize + 2];
            stream.read_exact(&mut dom).await?;
        }
        0x04 => {
            let mut b = [0u8; 16 + 2];
            stream.read_exact(&mut b).await?;
        }
        _ => return Err(proto_err("socks5: bad atyp")),
    }
    Ok(())
}
