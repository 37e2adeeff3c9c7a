// src/slab.rs
//
// Fixed-capacity connection arena, one per worker. Slot indices double
// as poll tokens, so lookups from epoll events are O(1) and free-list
// handling never allocates.

use crate::conn::Connection;
use crate::error::{EngineError, RavelResult};
use crate::pool::RequestPool;
use crate::socket::Socket;

struct Slot<S: Socket> {
    /// Intrusive free-list link; -1 terminates. Meaningful only while
    /// the slot is vacant.
    next_free: i32,
    conn: Option<Connection<S>>,
}

pub struct ConnectionSlab<S: Socket> {
    slots: Box<[Slot<S>]>,
    head_free: i32,
    active_count: usize,
}

impl<S: Socket> ConnectionSlab<S> {
    /// Allocate every slot once, at worker startup.
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        for i in 0..capacity {
            slots.push(Slot {
                next_free: if i == capacity - 1 { -1 } else { (i + 1) as i32 },
                conn: None,
            });
        }
        Self {
            slots: slots.into_boxed_slice(),
            head_free: 0,
            active_count: 0,
        }
    }

    /// O(1) insertion; the returned index is the connection's poll
    /// token. `ArenaFull` when every slot is occupied.
    pub fn insert(&mut self, mut conn: Connection<S>) -> RavelResult<usize> {
        if self.head_free == -1 {
            return Err(EngineError::ArenaFull);
        }
        let idx = self.head_free as usize;
        let slot = &mut self.slots[idx];
        debug_assert!(slot.conn.is_none());
        self.head_free = slot.next_free;

        conn.poll_token = Some(idx);
        slot.conn = Some(conn);
        self.active_count += 1;
        Ok(idx)
    }

    /// O(1) removal. The connection is cleaned first so its queued
    /// descriptors recycle into `pool`; dropping it closes the socket.
    /// A vacant or out-of-range index is a no-op.
    pub fn free(&mut self, index: usize, pool: &mut RequestPool) {
        let Some(slot) = self.slots.get_mut(index) else {
            return;
        };
        let Some(mut conn) = slot.conn.take() else {
            return; // double free
        };
        conn.clean(Some(pool));
        drop(conn);

        slot.next_free = self.head_free;
        self.head_free = index as i32;
        self.active_count -= 1;
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Connection<S>> {
        self.slots.get_mut(index).and_then(|s| s.conn.as_mut())
    }

    pub fn get(&self, index: usize) -> Option<&Connection<S>> {
        self.slots.get(index).and_then(|s| s.conn.as_ref())
    }

    pub fn len(&self) -> usize {
        self.active_count
    }

    pub fn is_empty(&self) -> bool {
        self.active_count == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Visit every occupied slot. Used for the timeout sweep and for
    /// draining on shutdown.
    pub fn iter_active(&self) -> impl Iterator<Item = (usize, &Connection<S>)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.conn.as_ref().map(|c| (i, c)))
    }

    /// Occupied slot indices, collected so the caller can mutate slots
    /// while walking them.
    pub fn active_tokens(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.conn.as_ref().map(|_| i))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::IoStatus;
    use std::io;

    struct NullSocket;
    impl Socket for NullSocket {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<IoStatus> {
            Ok(IoStatus::WouldBlock)
        }
        fn write(&mut self, buf: &[u8]) -> io::Result<IoStatus> {
            Ok(IoStatus::Ready(buf.len()))
        }
        fn shutdown_write(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn insert_free_reuse() {
        let mut pool = RequestPool::new(4);
        let mut slab: ConnectionSlab<NullSocket> = ConnectionSlab::new(4);
        assert_eq!(slab.capacity(), 4);

        let a = slab.insert(Connection::new(NullSocket)).unwrap();
        let b = slab.insert(Connection::new(NullSocket)).unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(slab.get(a).unwrap().poll_token, Some(0));
        assert_eq!(slab.len(), 2);

        slab.free(a, &mut pool);
        assert_eq!(slab.len(), 1);
        assert!(slab.get(a).is_none());

        // LIFO reuse of the freed slot
        let c = slab.insert(Connection::new(NullSocket)).unwrap();
        assert_eq!(c, 0);
    }

    #[test]
    fn exhaustion_and_double_free() {
        let mut pool = RequestPool::new(4);
        let mut slab: ConnectionSlab<NullSocket> = ConnectionSlab::new(2);
        slab.insert(Connection::new(NullSocket)).unwrap();
        slab.insert(Connection::new(NullSocket)).unwrap();
        assert!(matches!(
            slab.insert(Connection::new(NullSocket)),
            Err(EngineError::ArenaFull)
        ));

        slab.free(0, &mut pool);
        slab.free(0, &mut pool); // ignored
        slab.free(99, &mut pool); // ignored
        assert_eq!(slab.len(), 1);
        assert!(slab.insert(Connection::new(NullSocket)).is_ok());
    }

    #[test]
    fn free_recycles_queued_descriptors() {
        let mut pool = RequestPool::new(4);
        let mut slab: ConnectionSlab<NullSocket> = ConnectionSlab::new(2);
        let idx = slab.insert(Connection::new(NullSocket)).unwrap();
        slab.get_mut(idx)
            .unwrap()
            .enqueue_request(Box::new(crate::request::RequestDescriptor::new()));

        slab.free(idx, &mut pool);
        assert_eq!(pool.len(), 1);
    }
}
