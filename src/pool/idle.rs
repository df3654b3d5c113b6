use crate::network::Connection;
use crate::protocol::Role;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::trace;

#[derive(Default)]
struct Slots {
    /// Most recently released connection
    tail: Option<Connection>,
    /// Older idle connections, most recent first
    list: VecDeque<Connection>,
}

/// Where a connection sat before it was taken out for a check
#[derive(Clone, Copy)]
enum Place {
    Tail,
    List(usize),
}

impl Slots {
    fn refill_tail(&mut self) {
        if self.tail.is_none() {
            self.tail = self.list.pop_front();
        }
    }

    /// Take the first entry accepted by `wanted`, tail first
    fn take_first<F: Fn(&Connection) -> bool>(&mut self, wanted: F) -> Option<Connection> {
        if self.tail.as_ref().is_some_and(&wanted) {
            return self.tail.take();
        }
        let index = self.list.iter().position(wanted)?;
        self.list.remove(index)
    }

    fn take_id(&mut self, id: usize) -> Option<(Place, Connection)> {
        if self.tail.as_ref().is_some_and(|c| c.id() == id) {
            return self.tail.take().map(|c| (Place::Tail, c));
        }
        let index = self.list.iter().position(|c| c.id() == id)?;
        self.list.remove(index).map(|c| (Place::List(index), c))
    }

    fn put_back(&mut self, place: Place, conn: Connection) {
        match place {
            Place::Tail if self.tail.is_none() => self.tail = Some(conn),
            Place::Tail => self.list.push_front(conn),
            Place::List(index) => {
                let index = index.min(self.list.len());
                self.list.insert(index, conn);
            }
        }
    }

    fn ids(&self) -> Vec<usize> {
        self.tail
            .iter()
            .chain(self.list.iter())
            .map(Connection::id)
            .collect()
    }
}

/// Connections nobody currently holds.
///
/// Liveness checks touch the socket, so candidates are taken out of the
/// store before they are checked and the lock is never held meanwhile.
#[derive(Default)]
pub struct IdleStore {
    slots: Mutex<Slots>,
}

fn matches(conn: &Connection, db: u32, role: Role) -> bool {
    conn.db() == db && conn.role().serves(role)
}

impl IdleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a released connection as the new tail
    pub fn push(&self, mut conn: Connection) {
        conn.set_pooled_since(Some(Instant::now()));
        let mut slots = self.slots.lock();
        if let Some(previous) = slots.tail.replace(conn) {
            slots.list.push_front(previous);
        }
    }

    /// Take a live connection for `db` that serves `role`, tail first.
    /// Dead matches found on the way are dropped.
    pub fn dequeue(&self, db: u32, role: Role) -> Option<Connection> {
        loop {
            let candidate = {
                let mut slots = self.slots.lock();
                let candidate = slots.take_first(|c| matches(c, db, role));
                slots.refill_tail();
                candidate
            }?;

            if candidate.is_alive() {
                let mut conn = candidate;
                conn.set_pooled_since(None);
                return Some(conn);
            }
            trace!("Dropping dead idle connection {}", candidate.id());
        }
    }

    /// Run `check` on every idle entry, one entry at a time with the lock
    /// released. Entries that pass go back where they were; the rest are
    /// returned to the caller.
    pub fn retain_checked<F>(&self, mut check: F) -> Vec<Connection>
    where
        F: FnMut(&mut Connection) -> bool,
    {
        let ids = self.slots.lock().ids();
        let mut failed = Vec::new();
        for id in ids {
            // Gone already when someone dequeued it meanwhile
            let Some((place, mut conn)) = self.slots.lock().take_id(id) else {
                continue;
            };
            if check(&mut conn) {
                self.slots.lock().put_back(place, conn);
            } else {
                failed.push(conn);
            }
        }
        self.slots.lock().refill_tail();
        failed
    }

    /// Remove entries idle longer than `idle_timeout` or no longer alive
    pub fn purge(&self, idle_timeout: Duration) -> usize {
        let now = Instant::now();
        let stale = |conn: &Connection| {
            conn.pooled_since()
                .is_some_and(|since| now.duration_since(since) >= idle_timeout)
        };

        let mut removed = Vec::new();
        {
            let mut slots = self.slots.lock();
            while let Some(conn) = slots.take_first(stale) {
                removed.push(conn);
            }
            slots.refill_tail();
        }
        removed.extend(self.retain_checked(|conn| conn.is_alive()));
        removed.len()
    }

    /// Take every idle connection out of the store
    pub fn drain(&self) -> Vec<Connection> {
        let mut slots = self.slots.lock();
        let mut all: Vec<Connection> = slots.tail.take().into_iter().collect();
        all.extend(slots.list.drain(..));
        all
    }

    pub fn clear(&self) -> usize {
        self.drain().len()
    }

    pub fn len(&self) -> usize {
        let slots = self.slots.lock();
        slots.tail.iter().count() + slots.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
