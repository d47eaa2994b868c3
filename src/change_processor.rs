use std::{sync::Arc, time::Duration};

use crossbeam_channel::{select, Receiver, RecvError, Sender};
use jod_thread::JoinHandle;
use resultfs::FsEvent;

use crate::{
    backing::{FsStore, StoreEvent},
    mirror::Routed,
    session::SharedMirror,
};

/// Watcher events and the store that knows how to read them.
pub struct FsFeed {
    pub receiver: Receiver<FsEvent>,
    pub store: Arc<FsStore>,
}

/// Applies producer events to the mirror on a dedicated thread.
///
/// Three sources are multiplexed: events sent by producers, filesystem
/// watcher events, and an optional poll tick that re-reads every loaded
/// branch. All of them go through the same routing as direct producer calls.
pub struct ChangeProcessor {
    /// Signalled on drop. The job thread finishes its current event and
    /// exits.
    shutdown_sender: Sender<()>,

    /// Joined on drop.
    #[allow(unused)]
    job_thread: JoinHandle<Result<(), RecvError>>,
}

impl ChangeProcessor {
    pub fn start(
        mirror: Arc<SharedMirror>,
        event_receiver: Receiver<StoreEvent>,
        fs_feed: Option<FsFeed>,
        poll_interval: Option<Duration>,
    ) -> Self {
        let (shutdown_sender, shutdown_receiver) = crossbeam_channel::bounded(1);

        let (fs_receiver, fs_store) = match fs_feed {
            Some(feed) => (feed.receiver, Some(feed.store)),
            None => (crossbeam_channel::never(), None),
        };
        let ticker = match poll_interval {
            Some(interval) => crossbeam_channel::tick(interval),
            None => crossbeam_channel::never(),
        };

        let task = JobThreadContext { mirror, fs_store };

        let job_thread = jod_thread::Builder::new()
            .name("ChangeProcessor thread".to_owned())
            .spawn(move || {
                log::trace!("ChangeProcessor thread started");

                loop {
                    select! {
                        recv(event_receiver) -> event => {
                            task.handle_store_event(event?);
                        },
                        recv(fs_receiver) -> event => {
                            task.handle_fs_event(event?);
                        },
                        recv(ticker) -> _ => {
                            task.poll();
                        },
                        recv(shutdown_receiver) -> _ => {
                            log::trace!("ChangeProcessor shutdown signal received...");
                            return Ok(());
                        },
                    }
                }
            })
            .expect("Could not start ChangeProcessor thread");

        Self {
            shutdown_sender,
            job_thread,
        }
    }
}

impl Drop for ChangeProcessor {
    fn drop(&mut self) {
        let _ = self.shutdown_sender.send(());
    }
}

struct JobThreadContext {
    mirror: Arc<SharedMirror>,

    /// Present when watcher events are being fed in.
    fs_store: Option<Arc<FsStore>>,
}

impl JobThreadContext {
    fn handle_store_event(&self, event: StoreEvent) {
        log::trace!("Store event: {:?}", event);

        match self.mirror.apply(event) {
            Ok(Routed::NotFound) => log::debug!("Store event matched nothing in the mirror"),
            Ok(_) => {}
            Err(err) => log::warn!("Could not apply store event: {}", err),
        }
    }

    #[profiling::function]
    fn handle_fs_event(&self, event: FsEvent) {
        log::trace!("Fs event: {:?}", event);

        let Some(store) = &self.fs_store else {
            return;
        };

        match store.translate(&event) {
            Some(store_event) => self.handle_store_event(store_event),
            None => log::trace!("Ignoring {}", event.path().display()),
        }
    }

    fn poll(&self) {
        let changed = self.mirror.refresh();
        if changed > 0 {
            log::debug!("Poll refreshed {} branch(es)", changed);
        }
    }
}
