use crate::prelude::*;

#[derive(Debug, Clone)]
pub struct Channels {
    pub ticks: broadcast::Sender<crate::scheduler::ChannelData>,
}

impl Default for Channels {
    fn default() -> Self {
        Self::new()
    }
}

impl Channels {
    pub fn new() -> Self {
        Self {
            ticks: Self::channel(),
        }
    }

    fn channel<T: Clone>() -> broadcast::Sender<T> {
        broadcast::channel(512).0
    }
}
