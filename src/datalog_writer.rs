use crate::prelude::*;

use crate::scheduler::ChannelData;
use tokio::io::AsyncWriteExt;

/// Appends every acquisition tick as one JSON line to a file. Purely
/// diagnostic; write errors are logged and the loop keeps running.
#[derive(Clone)]
pub struct DatalogWriter {
    path: String,
    channels: Channels,
}

impl DatalogWriter {
    pub fn new(path: String, channels: Channels) -> Self {
        Self { path, channels }
    }

    pub async fn start(&self) -> Result<()> {
        info!("datalog writer appending to {}", self.path);

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("cannot open datalog file {}", self.path))?;

        let mut receiver = self.channels.ticks.subscribe();

        loop {
            match receiver.recv().await? {
                ChannelData::Shutdown => break,
                ChannelData::Tick(tick) => {
                    let mut line = match serde_json::to_string(&tick) {
                        Ok(line) => line,
                        Err(e) => {
                            error!("cannot serialize tick: {}", e);
                            continue;
                        }
                    };
                    line.push('\n');

                    if let Err(e) = file.write_all(line.as_bytes()).await {
                        error!("datalog write failed: {}", e);
                    }
                    let _ = file.flush().await;
                }
            }
        }

        info!("datalog writer exiting");

        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.channels.ticks.send(ChannelData::Shutdown);
    }
}
