//! Job-connection listener
//!
//! A requester opens a TCP connection, sends the nonce from
//! `prepare_job_connection` followed by a newline, then reads the job's CBOR
//! frames until the provider shuts the connection down.

use crate::provider::CompletionProvider;
use anyhow::{Context, Result, bail};
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// Longest accepted nonce line, newline included
const MAX_NONCE_LINE: u64 = 64;

pub struct JobConnectionListener {
    listener: TcpListener,
}

impl JobConnectionListener {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind job listener on {}", addr))?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept job connections until the listener fails
    pub async fn serve(self, provider: CompletionProvider) -> Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let provider = provider.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, provider).await {
                    tracing::warn!(peer = %peer, "Job connection failed: {:#}", e);
                }
            });
        }
    }
}

async fn handle_connection(stream: TcpStream, provider: CompletionProvider) -> Result<()> {
    stream.set_nodelay(true)?;
    let mut reader = BufReader::new(stream);

    let mut line = String::new();
    (&mut reader)
        .take(MAX_NONCE_LINE)
        .read_line(&mut line)
        .await
        .context("Failed to read nonce")?;
    if !line.ends_with('\n') {
        bail!("Nonce line missing or too long");
    }

    let stream = reader.into_inner();
    let pipe = provider.on_job_connection(line.trim(), stream).await?;
    pipe.await
        .context("Job connection task panicked")?
        .context("Failed to write job frames")?;
    Ok(())
}
