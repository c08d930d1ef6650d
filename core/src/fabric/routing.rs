//! Routing tables: the mailboxes point-to-point transfers land in.
//!
//! Every chip has one mailbox per (link lane, direction). A sender pushes a
//! [`Packet`] into the receiver's mailbox and then bumps the receiver's
//! semaphore; the receiver waits on the semaphore and only then pops, so a
//! pop never finds the mailbox empty unless the protocol was violated.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crossbeam::channel::{unbounded, Receiver, Sender, TryRecvError};

use crate::error::{CclError, Result};
use crate::lock;
use crate::mesh::{ChipId, MeshShape};

/// Direction of travel along a line or ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Direction {
    /// Towards higher positions in the group.
    Forward,
    /// Towards lower positions in the group.
    Backward,
}

/// One payload in flight: chunk index plus the element buffer.
pub(crate) struct Packet {
    pub(crate) chunk: usize,
    pub(crate) payload: Box<dyn Any + Send>,
}

struct Mailbox {
    tx: Sender<Packet>,
    rx: Receiver<Packet>,
}

pub(crate) struct RoutingTable {
    lanes: usize,
    mailboxes: HashMap<(ChipId, usize, Direction), Mailbox>,
    /// Held for the duration of one collective; mailboxes are not tagged
    /// per session, so dispatches sharing a table must not interleave.
    exclusive: Mutex<()>,
}

impl std::fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingTable")
            .field("lanes", &self.lanes)
            .field("mailboxes", &self.mailboxes.len())
            .finish()
    }
}

impl RoutingTable {
    pub(crate) fn build(shape: MeshShape, lanes: usize) -> Self {
        let mut mailboxes = HashMap::new();
        for chip in (0..shape.num_devices()).map(ChipId) {
            for lane in 0..lanes {
                for dir in [Direction::Forward, Direction::Backward] {
                    let (tx, rx) = unbounded();
                    mailboxes.insert((chip, lane, dir), Mailbox { tx, rx });
                }
            }
        }
        Self {
            lanes,
            mailboxes,
            exclusive: Mutex::new(()),
        }
    }

    pub(crate) fn lanes(&self) -> usize {
        self.lanes
    }

    pub(crate) fn exclusive(&self) -> MutexGuard<'_, ()> {
        lock(&self.exclusive)
    }

    fn mailbox(&self, chip: ChipId, lane: usize, dir: Direction) -> Result<&Mailbox> {
        self.mailboxes.get(&(chip, lane, dir)).ok_or_else(|| {
            CclError::Fabric(format!("no {dir:?} mailbox on chip {chip} lane {lane}"))
        })
    }

    pub(crate) fn send(&self, to: ChipId, lane: usize, dir: Direction, packet: Packet) -> Result<()> {
        self.mailbox(to, lane, dir)?
            .tx
            .send(packet)
            .map_err(|_| CclError::Fabric(format!("mailbox on chip {to} lane {lane} is closed")))
    }

    pub(crate) fn try_recv(&self, at: ChipId, lane: usize, dir: Direction) -> Result<Packet> {
        self.mailbox(at, lane, dir)?.rx.try_recv().map_err(|e| match e {
            TryRecvError::Empty => CclError::Fabric(format!(
                "semaphore signalled but {dir:?} mailbox on chip {at} lane {lane} is empty"
            )),
            TryRecvError::Disconnected => {
                CclError::Fabric(format!("mailbox on chip {at} lane {lane} is closed"))
            }
        })
    }

    /// Discards undelivered packets, returning how many there were.
    pub(crate) fn drain(&self) -> usize {
        self.mailboxes
            .values()
            .map(|mb| mb.rx.try_iter().count())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_and_receive() {
        let table = RoutingTable::build(MeshShape::new(1, 2).unwrap(), 2);
        assert_eq!(table.lanes(), 2);
        table
            .send(
                ChipId(1),
                1,
                Direction::Forward,
                Packet {
                    chunk: 3,
                    payload: Box::new(vec![1.0f32, 2.0]),
                },
            )
            .unwrap();

        assert!(table.try_recv(ChipId(1), 0, Direction::Forward).is_err());
        assert!(table.try_recv(ChipId(1), 1, Direction::Backward).is_err());

        let packet = table.try_recv(ChipId(1), 1, Direction::Forward).unwrap();
        assert_eq!(packet.chunk, 3);
        let data = packet.payload.downcast::<Vec<f32>>().unwrap();
        assert_eq!(*data, vec![1.0, 2.0]);
    }

    #[test]
    fn test_drain() {
        let table = RoutingTable::build(MeshShape::new(1, 2).unwrap(), 1);
        for chunk in 0..3 {
            table
                .send(
                    ChipId(0),
                    0,
                    Direction::Backward,
                    Packet {
                        chunk,
                        payload: Box::new(()),
                    },
                )
                .unwrap();
        }
        assert_eq!(table.drain(), 3);
        assert_eq!(table.drain(), 0);
    }

    #[test]
    fn test_unknown_mailbox() {
        let table = RoutingTable::build(MeshShape::new(1, 1).unwrap(), 1);
        assert!(matches!(
            table.try_recv(ChipId(5), 0, Direction::Forward),
            Err(CclError::Fabric(_))
        ));
    }
}
