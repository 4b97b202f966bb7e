//! The `/multistream/1.0.0` dialer/listener exchange (RFC: multiformats
//! `multistream-select`). Wire messages are `<varint length><utf8 bytes
//! including trailing \n>`; `na\n` is the fixed rejection message.

use futures::{AsyncRead, AsyncWrite, AsyncWriteExt};
use meshnet_varint::encode_usize;

use crate::error::NegotiationError;
use crate::framer::BufferedFramer;

pub const MULTISTREAM_HEADER: &str = "/multistream/1.0.0\n";
const NA: &str = "na\n";

/// Which multistream-select variant the initiator uses. Responders accept
/// both; the wire bytes are identical, only the initiator's write pattern
/// differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    V1,
    V1Lazy,
}

/// The outcome of a successful negotiation: the agreed protocol id, and any
/// bytes the other side sent past the negotiation boundary (never lost).
pub struct Negotiated<S> {
    pub protocol: String,
    pub remainder: Vec<u8>,
    pub stream: S,
}

fn frame_message(line: &str, out: &mut Vec<u8>) {
    encode_usize(line.len(), out);
    out.extend_from_slice(line.as_bytes());
}

fn decode_line(bytes: &[u8]) -> Result<String, NegotiationError> {
    let text = String::from_utf8(bytes.to_vec()).map_err(|_| NegotiationError::InvalidUtf8)?;
    if !text.ends_with('\n') {
        return Err(NegotiationError::InvalidUtf8);
    }
    Ok(text.trim_end_matches('\n').to_string())
}

/// Runs the initiator side of multistream-select, proposing `protocols` in
/// order until one is accepted or the list is exhausted.
pub async fn dialer_select_proto<S>(
    stream: S,
    protocols: &[String],
    version: Version,
    max_message_size: usize,
) -> Result<Negotiated<S>, NegotiationError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if protocols.is_empty() {
        return Err(NegotiationError::NoProtocolInCommon);
    }

    let mut framer = BufferedFramer::new(stream, max_message_size);
    let mut first_proposal = Vec::new();
    frame_message(MULTISTREAM_HEADER, &mut first_proposal);
    frame_message(&format!("{}\n", protocols[0]), &mut first_proposal);

    match version {
        // V1Lazy: header and the first proposal piggyback on a single
        // write, in anticipation of 0-RTT acceptance.
        Version::V1Lazy => framer.get_mut().write_all(&first_proposal).await?,
        // Plain V1: still only one round trip is required for the common
        // case, but we flush the header and the proposal as distinct
        // writes, matching a responder that expects no optimistic data.
        Version::V1 => {
            let mut header_only = Vec::new();
            frame_message(MULTISTREAM_HEADER, &mut header_only);
            framer.get_mut().write_all(&header_only).await?;
            let mut proposal_only = Vec::new();
            frame_message(&format!("{}\n", protocols[0]), &mut proposal_only);
            framer.get_mut().write_all(&proposal_only).await?;
        }
    }
    framer.get_mut().flush().await?;

    let header_echo = decode_line(&framer.read_message().await?)?;
    if header_echo != MULTISTREAM_HEADER.trim_end_matches('\n') {
        return Err(NegotiationError::UnexpectedHeader {
            expected: MULTISTREAM_HEADER.to_string(),
            actual: header_echo,
        });
    }

    let mut response = decode_line(&framer.read_message().await?)?;
    if response == protocols[0] {
        let remainder = framer.drain_remainder();
        return Ok(Negotiated {
            protocol: protocols[0].clone(),
            remainder,
            stream: framer.into_inner(),
        });
    }

    // Fall back to the remaining candidates one at a time.
    for candidate in &protocols[1..] {
        let mut out = Vec::new();
        frame_message(&format!("{candidate}\n"), &mut out);
        framer.get_mut().write_all(&out).await?;
        framer.get_mut().flush().await?;

        response = decode_line(&framer.read_message().await?)?;
        if response == *candidate {
            let remainder = framer.drain_remainder();
            return Ok(Negotiated {
                protocol: candidate.clone(),
                remainder,
                stream: framer.into_inner(),
            });
        }
    }

    Err(NegotiationError::NoProtocolInCommon)
}

/// Runs the responder side: reads the header, then replies `na` to every
/// unsupported proposal and echoes (accepting) the first one found in
/// `supported`.
pub async fn listener_select_proto<S>(
    stream: S,
    supported: &[String],
    max_message_size: usize,
) -> Result<Negotiated<S>, NegotiationError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framer = BufferedFramer::new(stream, max_message_size);

    let header = decode_line(&framer.read_message().await?)?;
    if header != MULTISTREAM_HEADER.trim_end_matches('\n') {
        return Err(NegotiationError::UnexpectedHeader {
            expected: MULTISTREAM_HEADER.to_string(),
            actual: header,
        });
    }
    let mut header_echo = Vec::new();
    frame_message(MULTISTREAM_HEADER, &mut header_echo);
    framer.get_mut().write_all(&header_echo).await?;
    framer.get_mut().flush().await?;

    loop {
        let proposal = decode_line(&framer.read_message().await?)?;
        if supported.iter().any(|p| p == &proposal) {
            let mut echo = Vec::new();
            frame_message(&format!("{proposal}\n"), &mut echo);
            framer.get_mut().write_all(&echo).await?;
            framer.get_mut().flush().await?;

            let remainder = framer.drain_remainder();
            return Ok(Negotiated {
                protocol: proposal,
                remainder,
                stream: framer.into_inner(),
            });
        }

        log::debug!("rejecting unsupported protocol proposal {proposal}");
        let mut na = Vec::new();
        frame_message(NA, &mut na);
        framer.get_mut().write_all(&na).await?;
        framer.get_mut().flush().await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio_util::compat::TokioAsyncReadCompatExt;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn dialer_and_listener_agree_on_first_supported_protocol() {
        let (client, server) = duplex(4096);
        let client = client.compat();
        let server = server.compat();

        let dial = tokio::spawn(async move {
            dialer_select_proto(
                client,
                &strings(&["/meshnet/ping/1.0.0"]),
                Version::V1Lazy,
                65536,
            )
            .await
        });
        let listen = tokio::spawn(async move {
            listener_select_proto(
                server,
                &strings(&["/meshnet/identify/1.0.0", "/meshnet/ping/1.0.0"]),
                65536,
            )
            .await
        });

        let dialed = dial.await.unwrap().unwrap();
        let listened = listen.await.unwrap().unwrap();
        assert_eq!(dialed.protocol, "/meshnet/ping/1.0.0");
        assert_eq!(listened.protocol, "/meshnet/ping/1.0.0");
    }

    #[tokio::test]
    async fn dialer_falls_back_after_na() {
        let (client, server) = duplex(4096);
        let client = client.compat();
        let server = server.compat();

        let dial = tokio::spawn(async move {
            dialer_select_proto(
                client,
                &strings(&["/meshnet/unsupported/1.0.0", "/meshnet/ping/1.0.0"]),
                Version::V1Lazy,
                65536,
            )
            .await
        });
        let listen = tokio::spawn(async move {
            listener_select_proto(server, &strings(&["/meshnet/ping/1.0.0"]), 65536).await
        });

        let dialed = dial.await.unwrap().unwrap();
        let listened = listen.await.unwrap().unwrap();
        assert_eq!(dialed.protocol, "/meshnet/ping/1.0.0");
        assert_eq!(listened.protocol, "/meshnet/ping/1.0.0");
    }

    #[tokio::test]
    async fn no_protocol_in_common_fails() {
        let (client, server) = duplex(4096);
        let client = client.compat();
        let server = server.compat();

        let dial = tokio::spawn(async move {
            dialer_select_proto(
                client,
                &strings(&["/meshnet/unsupported/1.0.0"]),
                Version::V1Lazy,
                65536,
            )
            .await
        });
        let listen = tokio::spawn(async move {
            listener_select_proto(server, &strings(&["/meshnet/ping/1.0.0"]), 65536).await
        });

        let dialed = dial.await.unwrap();
        assert!(matches!(
            dialed,
            Err(NegotiationError::NoProtocolInCommon)
        ));
        drop(listen);
    }
}
