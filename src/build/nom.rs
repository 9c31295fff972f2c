//! Funnel build output through a single `nom` process.
//!
//! When several builders run concurrently their interleaved output is
//! unreadable; `nom` renders it as a build graph. All build stdout lines
//! are forwarded over a channel into one long-lived `nom` child.

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};

/// A running `nom` child fed by every concurrent build.
pub struct NomFunnel {
    tx: UnboundedSender<String>,
}

impl NomFunnel {
    /// Spawns `nom` if it is on $PATH; otherwise returns `None` and
    /// builds stream to their log files only.
    pub async fn spawn() -> Option<NomFunnel> {
        let mut child = match Command::new("nom")
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(false)
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                tracing::debug!(%err, "nom not available, falling back to plain logs");
                return None;
            }
        };

        let mut stdin = child.stdin.take().expect("nom stdin is piped");
        let (tx, mut rx) = unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() {
                    break;
                }
            }
            // Sender side closed: end nom's input so it can render the
            // final state and exit.
            drop(stdin);
            let _ = child.wait().await;
        });

        Some(NomFunnel { tx })
    }

    /// A sender that forwards one build's stdout lines into the funnel.
    pub fn sender(&self) -> UnboundedSender<String> {
        self.tx.clone()
    }
}
