//! Asynchronous hostname resolution.
//!
//! Resolution uses the blocking system resolver, so it runs on a short-lived
//! helper thread; the completion callback posts the result back to the
//! network loop through its task queue.

use std::net::{SocketAddr, ToSocketAddrs};

pub(super) fn resolve_async(
    host: String,
    port: u16,
    done: impl FnOnce(Option<SocketAddr>) + Send + 'static,
) {
    let spawned = std::thread::Builder::new()
        .name("sonance-dns".into())
        .spawn(move || {
            let address = (host.as_str(), port)
                .to_socket_addrs()
                .ok()
                .and_then(|mut addrs| addrs.next());
            done(address);
        });

    if let Err(err) = spawned {
        log::error!("[Resolver] can't spawn resolver thread: {err}");
    }
}
