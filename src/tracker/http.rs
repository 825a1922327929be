//! Builds and fires the tracker's HTTP announce request and decodes the
//! compact peer list from its bencoded response.

use crate::torrent::Metainfo;
use anyhow::{bail, Context};
use serde::Deserialize;
use serde_bytes::ByteBuf;
use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4, TcpStream, ToSocketAddrs};
use std::time::Duration;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct BencodeAnnounceResponse {
    #[serde(default)]
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    #[serde(default)]
    interval: Option<i64>,
    peers: ByteBuf,
}

#[derive(Debug)]
pub struct AnnounceResponse {
    pub interval: Option<i64>,
    pub peers: Vec<SocketAddrV4>,
}

/// Builds the announce URL for the given metainfo/local-id/port, with query
/// parameters in the alphabetical order a canonical encoder (e.g. Go's
/// `url.Values.Encode`) would produce.
pub fn build_announce_url(
    announce: &str,
    info_digest: &[u8; 20],
    peer_id: &[u8; 20],
    port: u16,
    left: u64,
) -> anyhow::Result<String> {
    let query = format!(
        "compact=1&downloaded=0&info_hash={}&left={}&peer_id={}&port={}&uploaded=0",
        urlencoding::encode_binary(info_digest),
        left,
        urlencoding::encode_binary(peer_id),
        port,
    );
    Ok(format!("{announce}?{query}"))
}

/// Performs the tracker announce and returns the decoded peer list.
pub fn announce(
    metainfo: &Metainfo,
    local_id: [u8; 20],
    port: u16,
) -> anyhow::Result<AnnounceResponse> {
    let url_str = build_announce_url(
        &metainfo.announce,
        &metainfo.info_digest,
        &local_id,
        port,
        metainfo.length,
    )?;
    let url = Url::parse(&url_str).context("announce URL is not a valid URL")?;
    let host = url.host_str().context("announce URL has no host")?;
    let tracker_port = url.port_or_known_default().unwrap_or(80);

    let addr = (host, tracker_port)
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve tracker host {host}"))?
        .next()
        .with_context(|| format!("no addresses resolved for tracker host {host}"))?;

    let mut stream =
        TcpStream::connect_timeout(&addr, REQUEST_TIMEOUT).context("failed to connect to tracker")?;
    stream.set_read_timeout(Some(REQUEST_TIMEOUT))?;
    stream.set_write_timeout(Some(REQUEST_TIMEOUT))?;

    let mut path = url.path().to_string();
    if let Some(q) = url.query() {
        path.push('?');
        path.push_str(q);
    }
    let request = format!(
        "GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\nUser-Agent: bobby-bit/0.1\r\n\r\n"
    );
    stream
        .write_all(request.as_bytes())
        .context("failed to send announce request")?;

    let mut raw = Vec::new();
    stream
        .read_to_end(&mut raw)
        .context("failed to read tracker response")?;

    parse_announce_response(&raw)
}

fn parse_announce_response(raw: &[u8]) -> anyhow::Result<AnnounceResponse> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    let body_offset = match response
        .parse(raw)
        .context("failed to parse tracker HTTP response")?
    {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => bail!("tracker response was truncated"),
    };

    let status = response.code.context("tracker response had no status code")?;
    if !(200..300).contains(&status) {
        bail!("tracker returned non-2xx status {status}");
    }

    let body = &raw[body_offset..];
    let decoded: BencodeAnnounceResponse =
        serde_bencode::from_bytes(body).context("failed to parse bencoded tracker response")?;

    if let Some(reason) = decoded.failure_reason {
        bail!("tracker reported failure: {reason}");
    }

    let peers_blob = decoded.peers.into_vec();
    if peers_blob.len() % 6 != 0 {
        bail!(
            "compact peers blob length {} is not a multiple of 6",
            peers_blob.len()
        );
    }
    let peers = peers_blob
        .chunks(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddrV4::new(ip, port)
        })
        .collect();

    Ok(AnnounceResponse {
        interval: decoded.interval,
        peers,
    })
}
