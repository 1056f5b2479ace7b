use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{channel, Receiver, RecvTimeoutError, Sender},
        Arc,
    },
    time::Duration,
};

use crate::{
    error::{RareEventError, Result},
    producer::AcceptedSample,
};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Lane identity and the collective exchange between lanes.
pub trait Communicator: Send {
    fn lane(&self) -> usize;

    fn lane_count(&self) -> usize;

    /// Contribute one sample and receive every lane's sample, ordered by lane.
    ///
    /// Returns only after all lanes contributed to the same round.
    fn allgather(&mut self, sample: AcceptedSample) -> Result<Vec<AcceptedSample>>;
}

/// The trivial group of a single lane.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleLane;

impl Communicator for SingleLane {
    fn lane(&self) -> usize {
        0
    }

    fn lane_count(&self) -> usize {
        1
    }

    fn allgather(&mut self, sample: AcceptedSample) -> Result<Vec<AcceptedSample>> {
        Ok(vec![sample])
    }
}

#[derive(Debug)]
struct Envelope {
    round: u64,
    lane: usize,
    sample: AcceptedSample,
}

/// One member of an in-process group created by [`local_group`].
///
/// Each lane is meant to live on its own thread.
#[derive(Debug)]
pub struct LocalLane {
    lane: usize,
    lane_count: usize,
    peers: Vec<Sender<Envelope>>,
    inbox: Receiver<Envelope>,
    round: u64,
    parked: Vec<Envelope>,
    departed: Arc<[AtomicBool]>,
}

/// Create `lane_count` connected lanes.
pub fn local_group(lane_count: usize) -> Vec<LocalLane> {
    let (senders, inboxes): (Vec<_>, Vec<_>) = (0..lane_count).map(|_| channel()).unzip();
    let departed: Arc<[AtomicBool]> = (0..lane_count)
        .map(|_| AtomicBool::new(false))
        .collect();
    inboxes
        .into_iter()
        .enumerate()
        .map(|(lane, inbox)| LocalLane {
            lane,
            lane_count,
            peers: senders
                .iter()
                .enumerate()
                .filter(|&(peer, _)| peer != lane)
                .map(|(_, sender)| sender.clone())
                .collect(),
            inbox,
            round: 0,
            parked: Vec::new(),
            departed: departed.clone(),
        })
        .collect()
}

impl LocalLane {
    fn place(&mut self, slots: &mut [Option<AcceptedSample>], envelope: Envelope) -> Result<()> {
        if envelope.round > self.round {
            self.parked.push(envelope);
            return Ok(());
        }
        if envelope.round < self.round {
            return Err(RareEventError::Sequencing(format!(
                "lane {} received a message for round {} from lane {} during round {}",
                self.lane, envelope.round, envelope.lane, self.round
            )));
        }
        let Some(slot) = slots.get_mut(envelope.lane) else {
            return Err(RareEventError::Communication(format!(
                "message from unknown lane {}",
                envelope.lane
            )));
        };
        if slot.is_some() {
            return Err(RareEventError::Sequencing(format!(
                "lane {} received two messages from lane {} in round {}",
                self.lane, envelope.lane, self.round
            )));
        }
        *slot = Some(envelope.sample);
        Ok(())
    }

    /// A peer that left the group without contributing to this round.
    fn departed_peer(&self, slots: &[Option<AcceptedSample>]) -> Option<usize> {
        slots
            .iter()
            .enumerate()
            .find(|&(peer, slot)| slot.is_none() && self.departed[peer].load(Ordering::Acquire))
            .map(|(peer, _)| peer)
    }
}

impl Communicator for LocalLane {
    fn lane(&self) -> usize {
        self.lane
    }

    fn lane_count(&self) -> usize {
        self.lane_count
    }

    fn allgather(&mut self, sample: AcceptedSample) -> Result<Vec<AcceptedSample>> {
        for peer in self.peers.iter() {
            let envelope = Envelope {
                round: self.round,
                lane: self.lane,
                sample: sample.clone(),
            };
            peer.send(envelope).map_err(|_| {
                RareEventError::Communication(format!(
                    "lane {} could not reach a peer in round {}",
                    self.lane, self.round
                ))
            })?;
        }

        let mut slots: Vec<Option<AcceptedSample>> = vec![None; self.lane_count];
        slots[self.lane] = Some(sample);

        for envelope in std::mem::take(&mut self.parked) {
            self.place(&mut slots, envelope)?;
        }

        while slots.iter().any(Option::is_none) {
            match self.inbox.recv_timeout(POLL_INTERVAL) {
                Ok(envelope) => self.place(&mut slots, envelope)?,
                Err(RecvTimeoutError::Timeout) => {
                    let Some(peer) = self.departed_peer(&slots) else {
                        continue;
                    };
                    // A departed peer sent everything before leaving.
                    while let Ok(envelope) = self.inbox.try_recv() {
                        self.place(&mut slots, envelope)?;
                    }
                    if slots[peer].is_none() {
                        return Err(RareEventError::Communication(format!(
                            "lane {peer} left the group while lane {} waited in round {}",
                            self.lane, self.round
                        )));
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(RareEventError::Communication(format!(
                        "all peers of lane {} left the group in round {}",
                        self.lane, self.round
                    )))
                }
            }
        }

        self.round += 1;
        slots
            .into_iter()
            .enumerate()
            .map(|(lane, slot)| {
                slot.ok_or_else(|| {
                    RareEventError::Communication(format!("no sample from lane {lane}"))
                })
            })
            .collect()
    }
}

impl Drop for LocalLane {
    fn drop(&mut self) {
        self.departed[self.lane].store(true, Ordering::Release);
    }
}
