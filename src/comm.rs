//! Messaging substrate for the distributed sorter.
//!
//! The coordinator only needs rank/world identity, blocking match-sized
//! point-to-point byte transfers, broadcast and scatter from a root, a
//! global barrier, and a job-fatal abort. Any transport providing those
//! slots in behind [`Communicator`]; [`LocalCluster`] is the in-process
//! implementation (one OS thread per rank over a channel mesh).

use std::error::Error;
use std::fmt;
use std::process;
use std::sync::{Arc, Barrier};
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};

/// Substrate failure. Always fatal for the job.
#[derive(Debug)]
pub enum CommError {
    /// The peer's endpoint is gone.
    Disconnected { peer: usize },
    /// A received message did not match the posted buffer size.
    SizeMismatch { expected: usize, got: usize },
    /// A rank outside `[0, world)` was addressed.
    InvalidRank(usize),
    /// A root-side collective was called without its send buffer.
    MissingBuffer,
}

impl Error for CommError {}

impl fmt::Display for CommError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommError::Disconnected { peer } => write!(f, "worker {} disconnected", peer),
            CommError::SizeMismatch { expected, got } => {
                write!(f, "message size mismatch: expected {} bytes, got {}", expected, got)
            }
            CommError::InvalidRank(rank) => write!(f, "rank {} is not in this job", rank),
            CommError::MissingBuffer => write!(f, "collective root called without a send buffer"),
        }
    }
}

/// Point-to-point and collective operations the coordinator drives.
///
/// `recv` is blocking and match-sized: the caller's buffer length must equal
/// the length the peer sent. All workers must call collectives in the same
/// order with compatible buffer sizes.
pub trait Communicator: Send {
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;

    fn send(&self, dest: usize, buf: &[u8]) -> Result<(), CommError>;
    fn recv(&self, source: usize, buf: &mut [u8]) -> Result<(), CommError>;

    /// Broadcasts `buf` from `root` to every worker.
    fn broadcast(&self, root: usize, buf: &mut [u8]) -> Result<(), CommError>;

    /// Scatters equal-sized slices of the root's `send` buffer; worker `w`
    /// receives slice `w` into `recv`.
    fn scatter(&self, root: usize, send: Option<&[u8]>, recv: &mut [u8]) -> Result<(), CommError>;

    /// Blocks until every worker has entered the barrier.
    fn barrier(&self);

    /// Terminates the whole job. Never returns.
    fn abort(&self, code: i32) -> !;
}

/// In-process substrate: runs one closure per rank on its own thread, wired
/// through a full mesh of channels. Used by `dist-sort` and the tests; a
/// cluster transport would implement [`Communicator`] instead.
pub struct LocalCluster;

impl LocalCluster {
    /// Spawns `world` workers and blocks until all of them return, yielding
    /// their results in rank order.
    pub fn run<F, T>(world: usize, job: F) -> Vec<T>
    where
        F: Fn(LocalComm) -> T + Sync,
        T: Send,
    {
        assert!(world > 0, "a job needs at least one worker");

        let barrier = Arc::new(Barrier::new(world));
        let mut outboxes: Vec<Vec<Sender<Vec<u8>>>> = (0..world).map(|_| Vec::with_capacity(world)).collect();
        let mut inboxes: Vec<Vec<Receiver<Vec<u8>>>> = Vec::with_capacity(world);

        for _dest in 0..world {
            let mut inbox = Vec::with_capacity(world);
            for source_outbox in outboxes.iter_mut() {
                let (tx, rx) = unbounded();
                source_outbox.push(tx);
                inbox.push(rx);
            }
            inboxes.push(inbox);
        }

        let comms: Vec<LocalComm> = outboxes
            .into_iter()
            .zip(inboxes)
            .enumerate()
            .map(|(rank, (peers, inbox))| LocalComm {
                rank,
                world,
                peers,
                inbox,
                barrier: barrier.clone(),
            })
            .collect();

        let job = &job;
        thread::scope(|scope| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| scope.spawn(move || job(comm)))
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("worker thread panicked"))
                .collect()
        })
    }
}

/// One rank's endpoint in a [`LocalCluster`].
pub struct LocalComm {
    rank: usize,
    world: usize,
    /// Senders indexed by destination rank.
    peers: Vec<Sender<Vec<u8>>>,
    /// Receivers indexed by source rank.
    inbox: Vec<Receiver<Vec<u8>>>,
    barrier: Arc<Barrier>,
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world
    }

    fn send(&self, dest: usize, buf: &[u8]) -> Result<(), CommError> {
        let peer = self.peers.get(dest).ok_or(CommError::InvalidRank(dest))?;
        peer.send(buf.to_vec())
            .map_err(|_| CommError::Disconnected { peer: dest })
    }

    fn recv(&self, source: usize, buf: &mut [u8]) -> Result<(), CommError> {
        let inbox = self.inbox.get(source).ok_or(CommError::InvalidRank(source))?;
        let message = inbox
            .recv()
            .map_err(|_| CommError::Disconnected { peer: source })?;
        if message.len() != buf.len() {
            return Err(CommError::SizeMismatch {
                expected: buf.len(),
                got: message.len(),
            });
        }
        buf.copy_from_slice(&message);
        Ok(())
    }

    fn broadcast(&self, root: usize, buf: &mut [u8]) -> Result<(), CommError> {
        if self.rank == root {
            for dest in 0..self.world {
                if dest != root {
                    self.send(dest, buf)?;
                }
            }
            Ok(())
        } else {
            self.recv(root, buf)
        }
    }

    fn scatter(&self, root: usize, send: Option<&[u8]>, recv: &mut [u8]) -> Result<(), CommError> {
        if self.rank == root {
            let send = send.ok_or(CommError::MissingBuffer)?;
            let expected = recv.len() * self.world;
            if send.len() != expected {
                return Err(CommError::SizeMismatch {
                    expected,
                    got: send.len(),
                });
            }
            for dest in 0..self.world {
                let slice = &send[dest * recv.len()..(dest + 1) * recv.len()];
                if dest == root {
                    recv.copy_from_slice(slice);
                } else {
                    self.send(dest, slice)?;
                }
            }
            Ok(())
        } else {
            self.recv(root, recv)
        }
    }

    fn barrier(&self) {
        self.barrier.wait();
    }

    fn abort(&self, code: i32) -> ! {
        log::error!("worker {} aborting the job (code {})", self.rank, code);
        process::exit(code);
    }
}

#[cfg(test)]
mod test {
    use byteorder::{ByteOrder, LittleEndian};

    use super::{CommError, Communicator, LocalCluster};

    #[test]
    fn test_point_to_point_ring() {
        let sums = LocalCluster::run(4, |comm| {
            let next = (comm.rank() + 1) % comm.world_size();
            let prev = (comm.rank() + comm.world_size() - 1) % comm.world_size();

            comm.send(next, &(comm.rank() as u64).to_le_bytes()).unwrap();
            let mut buf = [0u8; 8];
            comm.recv(prev, &mut buf).unwrap();
            u64::from_le_bytes(buf)
        });
        assert_eq!(sums, vec![3, 0, 1, 2]);
    }

    #[test]
    fn test_broadcast_reaches_everyone() {
        let seen = LocalCluster::run(3, |comm| {
            let mut buf = [0u8; 8];
            if comm.rank() == 0 {
                LittleEndian::write_u64(&mut buf, 9001);
            }
            comm.broadcast(0, &mut buf).unwrap();
            LittleEndian::read_u64(&buf)
        });
        assert_eq!(seen, vec![9001, 9001, 9001]);
    }

    #[test]
    fn test_scatter_with_counts() {
        let got = LocalCluster::run(4, |comm| {
            let send = if comm.rank() == 0 {
                let mut all = vec![0u8; 4 * 8];
                for rank in 0..4u64 {
                    LittleEndian::write_u64(&mut all[rank as usize * 8..], rank * 10);
                }
                Some(all)
            } else {
                None
            };

            let mut recv = [0u8; 8];
            comm.scatter(0, send.as_deref(), &mut recv).unwrap();
            LittleEndian::read_u64(&recv)
        });
        assert_eq!(got, vec![0, 10, 20, 30]);
    }

    #[test]
    fn test_recv_rejects_mismatched_size() {
        LocalCluster::run(2, |comm| {
            if comm.rank() == 0 {
                comm.send(1, &[1, 2, 3]).unwrap();
            } else {
                let mut buf = [0u8; 8];
                match comm.recv(0, &mut buf) {
                    Err(CommError::SizeMismatch { expected: 8, got: 3 }) => {}
                    other => panic!("expected SizeMismatch, got {:?}", other),
                }
            }
        });
    }

    #[test]
    fn test_barrier_orders_phases() {
        let results = LocalCluster::run(3, |comm| {
            // Everyone sends to rank 0 before the barrier; rank 0 drains
            // after it, so all three messages must be waiting.
            if comm.rank() != 0 {
                comm.send(0, &[comm.rank() as u8]).unwrap();
            }
            comm.barrier();
            if comm.rank() == 0 {
                let mut total = 0u32;
                for source in 1..comm.world_size() {
                    let mut buf = [0u8; 1];
                    comm.recv(source, &mut buf).unwrap();
                    total += u32::from(buf[0]);
                }
                total
            } else {
                0
            }
        });
        assert_eq!(results[0], 3);
    }
}
