use super::{Cookie, Member, Membership, PendingConnection, COOKIE_LEN};
use crate::rpc::{
    wire::{read_frame, write_frame, Hello, Welcome},
    RemoteEndpoint,
};
use std::{
    io::{self, Read},
    net::{Shutdown, TcpListener, TcpStream},
    sync::{Arc, Weak},
    thread,
    time::{Duration, Instant, SystemTime},
};
use tracing::{debug, error, info, warn};

/// how long the join loop waits for pending connections before checking if it is still needed
const JOIN_POLL: Duration = Duration::from_millis(200);

/// start the accept and the join loop
pub(super) fn start(membership: Weak<Membership>, listener: TcpListener) -> io::Result<()> {
    let accepting = membership.clone();

    thread::Builder::new()
        .name("flock-accept".to_string())
        .spawn(move || accept_loop(accepting, listener))?;

    thread::Builder::new()
        .name("flock-join".to_string())
        .spawn(move || join_loop(membership))?;

    Ok(())
}

fn accept_loop(membership: Weak<Membership>, listener: TcpListener) {
    for connection in listener.incoming() {
        let Some(owner) = membership.upgrade() else {
            break;
        };

        match connection {
            Ok(stream) => {
                let cookie = owner.cookie().clone();
                let timeout = owner.options().worker_timeout;
                let membership = membership.clone();

                // a slow peer must not hold up the accept loop
                let spawned = thread::Builder::new()
                    .name("flock-authenticate".to_string())
                    .spawn(move || {
                        if let Some(connection) = authenticate(stream, &cookie, timeout) {
                            if let Some(owner) = membership.upgrade() {
                                owner.enqueue(connection);
                            }
                        }
                    });

                if let Err(error) = spawned {
                    warn!(error = ?error, "Failed to start authentication, dropping connection");
                }
            }
            Err(error) => {
                warn!(error = ?error, "Failed to accept connection");
            }
        }
    }

    debug!("Accept loop stopped");
}

/// Check the cookie sent as the first bytes of a connection.
/// Rejections are logged and the connection is closed, nothing is propagated.
fn authenticate(mut stream: TcpStream, cookie: &Cookie, timeout: Duration) -> Option<PendingConnection> {
    let peer = match stream.peer_addr() {
        Ok(peer) => peer,
        Err(error) => {
            debug!(error = ?error, "Connection vanished before authentication");
            return None;
        }
    };

    if let Err(error) = stream.set_read_timeout(Some(timeout)) {
        debug!(peer = %peer, error = ?error, "Failed to set cookie read timeout");
        return None;
    }

    let mut candidate = [0u8; COOKIE_LEN];

    match stream.read_exact(&mut candidate) {
        Ok(()) if cookie.matches(&candidate) => Some(PendingConnection {
            stream,
            peer,
            accepted: Instant::now(),
        }),
        Ok(()) => {
            error!(peer = %peer, "Rejected connection: invalid cookie");
            let _ = stream.shutdown(Shutdown::Both);

            None
        }
        Err(error) => {
            error!(peer = %peer, error = ?error, "Rejected connection: no cookie received");
            let _ = stream.shutdown(Shutdown::Both);

            None
        }
    }
}

fn join_loop(membership: Weak<Membership>) {
    while let Some(owner) = membership.upgrade() {
        if let Some(connection) = owner.next_pending(JOIN_POLL) {
            handshake(&owner, connection);
        }
    }

    debug!("Join loop stopped");
}

/// Promote an authenticated connection to an active member.
/// Connections that drop or stall during the handshake are discarded.
fn handshake(membership: &Arc<Membership>, connection: PendingConnection) {
    let PendingConnection {
        mut stream,
        peer,
        accepted,
    } = connection;

    let remaining = membership
        .options()
        .worker_timeout
        .saturating_sub(accepted.elapsed())
        .max(Duration::from_millis(1));

    if let Err(error) = stream.set_read_timeout(Some(remaining)) {
        debug!(peer = %peer, error = ?error, "Discarding connection");
        return;
    }

    let hello: Hello = match read_frame(&mut stream) {
        Ok(hello) => hello,
        Err(error) => {
            debug!(peer = %peer, error = ?error, "Discarding connection that dropped during the handshake");
            return;
        }
    };

    let worker = membership.next_id();

    if let Err(error) = write_frame(&mut stream, &Welcome { worker }) {
        debug!(peer = %peer, worker = %worker, error = ?error, "Discarding connection that dropped during the handshake");
        return;
    }

    let owner = Arc::downgrade(membership);
    let endpoint = match RemoteEndpoint::start(worker, stream, move |worker| {
        if let Some(membership) = owner.upgrade() {
            membership.disconnected(worker);
        }
    }) {
        Ok(endpoint) => endpoint,
        Err(error) => {
            warn!(peer = %peer, worker = %worker, error = ?error, "Failed to set up connection to worker");
            return;
        }
    };

    info!(
        worker = %worker,
        peer = %peer,
        pid = hello.pid,
        host = %hello.hostname,
        "Worker joined the cluster"
    );

    membership.admit(Member {
        id: worker,
        peer,
        pid: hello.pid,
        hostname: hello.hostname,
        joined: SystemTime::now(),
        endpoint,
    });
}
