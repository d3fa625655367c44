//! Watcher thread supervision
//!
//! One thread per IMAP endpoint runs a connect/IDLE/reconnect loop with a
//! 30s backoff on connect failure; a single thread polls every Maildir
//! store at a fixed interval. Both funnel into the shared task queue
//! (spec.md §4.2, §4.5).

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::dispatcher::Task;
use crate::idle;
use crate::imap::ImapSession;
use crate::model::{Endpoint, ImapStore, Store, SyncMap};
use crate::pool::ConnectionPool;

/// Default interval between local Maildir re-scans.
pub const T_POLL: Duration = Duration::from_secs(60);

/// Spawn one watcher thread per IMAP endpoint in `syncmap`, plus a single
/// local-Maildir poller thread. All threads are daemon-style: they run for
/// the life of the process and are torn down via `pool.close_all()`.
pub fn start_watching(
    tasks: &Sender<Task>,
    syncmap: &SyncMap,
    stores: &HashMap<String, Store>,
    pool: &Arc<ConnectionPool>,
    poll_period: Duration,
) {
    for (ep, _) in syncmap.iter() {
        let Some(Store::Imap(store)) = stores.get(&ep.store) else {
            continue;
        };
        let store = store.clone();
        let ep = ep.clone();
        let tasks = tasks.clone();
        let pool = Arc::clone(pool);
        let thread_name = format!("watch:{}:{}", store.name, ep.mailbox);
        thread::Builder::new()
            .name(thread_name)
            .spawn(move || watch_errors(&pool, &store, &ep, &tasks))
            .expect("spawning IMAP watcher thread");
    }

    let tasks = tasks.clone();
    thread::Builder::new()
        .name("watch:local".to_owned())
        .spawn(move || watch_local(&tasks, poll_period))
        .expect("spawning local poller thread");
}

/// Connect (or reconnect), run the IDLE loop, and keep retrying on
/// transient failures until the session is marked terminating. A connect
/// failure backs off 30s before retrying; a failure after a successful
/// connect (i.e. inside the IDLE loop itself) retries immediately, since
/// upstream treats "we were already talking to the server" as evidence
/// the network is probably fine and the blip was momentary.
fn watch_errors(pool: &ConnectionPool, store: &ImapStore, ep: &Endpoint, tasks: &Sender<Task>) {
    let mut session: Option<Arc<ImapSession>> = None;

    loop {
        let connected = store.password().and_then(|pass| match &session {
            Some(old) => {
                debug!(store = %store.name, mailbox = %ep.mailbox, "trying to reconnect");
                pool.reconnect(old, pass, store.tls_mode)
            }
            None => pool.get_or_create(&store.host, &store.user, pass, store.port, store.tls_mode),
        });

        let current = match connected {
            Ok(s) => s,
            Err(e) => {
                if session
                    .as_ref()
                    .is_some_and(|old| old.terminating.load(Ordering::SeqCst))
                {
                    debug!(store = %store.name, mailbox = %ep.mailbox, "stopped while reconnecting");
                    return;
                }
                if !e.is_transient() {
                    error!(store = %store.name, mailbox = %ep.mailbox, error = %e, "giving up");
                    let _ = tasks.send(Task::Error(e));
                    return;
                }
                error!(store = %store.name, mailbox = %ep.mailbox, error = %e, "connect failed, retrying in 30s");
                thread::sleep(Duration::from_secs(30));
                continue;
            }
        };

        let watch_tasks = tasks.clone();
        let watch_ep = ep.clone();
        let result = idle::watch(&current, &ep.path, move || {
            let _ = watch_tasks.send(Task::Sync(vec![watch_ep.clone()]));
        });

        match result {
            Ok(()) => {
                debug!(store = %store.name, mailbox = %ep.mailbox, "watcher stopped");
                return;
            }
            Err(e) => {
                if current.terminating.load(Ordering::SeqCst) {
                    debug!(store = %store.name, mailbox = %ep.mailbox, "stopped during idle");
                    return;
                }
                if !e.is_transient() {
                    error!(store = %store.name, mailbox = %ep.mailbox, error = %e, "giving up");
                    let _ = tasks.send(Task::Error(e));
                    return;
                }
                error!(store = %store.name, mailbox = %ep.mailbox, error = %e, "idle failed, reconnecting");
                session = Some(current);
            }
        }
    }
}

fn watch_local(tasks: &Sender<Task>, period: Duration) {
    loop {
        thread::sleep(period);
        if tasks.send(Task::Local).is_err() {
            info!("dispatcher gone, stopping local poller");
            return;
        }
    }
}
