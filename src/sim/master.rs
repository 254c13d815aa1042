//! Scripted bus master for the simulator.

use crate::proto::{COMMAND_BLOCK_LEN, CommandCode};

/// Idle ticks between back-to-back transfers unless a script says otherwise.
const DEFAULT_GAP: u64 = 64;
/// Ticks between chip select going low and the first clock edge.
const DEFAULT_CS_SETUP: u64 = 4;

/// An acknowledgement is the command byte followed by enough dummy words to
/// clock out the flushed FIFO and the 8-byte reply.
const ACKNOWLEDGE_LEN: usize = 2 * COMMAND_BLOCK_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Trigger {
    /// Start this many ticks after the previous transfer ended.
    AfterGap(u64),
    /// Start this many ticks after the interrupt output is seen asserted.
    OnInterrupt { delay: u64 },
}

/// One chip-select window as the master drives it.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub(crate) trigger: Trigger,
    pub(crate) mosi: Vec<u16>,
    pub(crate) bits: u8,
    /// `None` takes the simulator's configured SCK period.
    pub(crate) bit_ticks: Option<u64>,
    pub(crate) cs_setup: u64,
    /// Clock periods driven before chip select is released.
    pub(crate) abort_after_bits: Option<u64>,
}

impl Transfer {
    pub fn words(words: &[u16], bits: u8) -> Self {
        Self {
            trigger: Trigger::AfterGap(DEFAULT_GAP),
            mosi: words.to_vec(),
            bits,
            bit_ticks: None,
            cs_setup: DEFAULT_CS_SETUP,
            abort_after_bits: None,
        }
    }

    pub fn bytes(bytes: &[u8]) -> Self {
        let words: Vec<u16> = bytes.iter().map(|&b| u16::from(b)).collect();
        Self::words(&words, 8)
    }

    /// Clocks `len` zero bytes, e.g. to read a response.
    pub fn idle(len: usize) -> Self {
        Self::words(&vec![0; len], 8)
    }

    /// AcknowledgeInterrupt clocked at one tick per bit.
    pub fn acknowledge() -> Self {
        let mut bytes = [0u8; ACKNOWLEDGE_LEN];
        bytes[0] = CommandCode::AcknowledgeInterrupt as u8;
        Self::bytes(&bytes).bit_ticks(1)
    }

    pub fn after(mut self, gap: u64) -> Self {
        self.trigger = Trigger::AfterGap(gap);
        self
    }

    pub fn on_interrupt(mut self, delay: u64) -> Self {
        self.trigger = Trigger::OnInterrupt { delay };
        self
    }

    pub fn bit_ticks(mut self, ticks: u64) -> Self {
        self.bit_ticks = Some(ticks.max(1));
        self
    }

    /// Releases chip select in place of the clock for word `words`.
    pub fn abort_after(self, words: usize) -> Self {
        let bits = words as u64 * u64::from(self.bits);
        self.abort_after_bits(bits)
    }

    /// Releases chip select after `bits` clock periods, mid-word if that is
    /// where they run out.
    pub fn abort_after_bits(mut self, bits: u64) -> Self {
        self.abort_after_bits = Some(bits);
        self
    }

    fn total_bits(&self) -> u64 {
        self.mosi.len() as u64 * u64::from(self.bits)
    }

    fn bits_to_clock(&self) -> u64 {
        let total = self.total_bits();
        self.abort_after_bits.map_or(total, |n| n.min(total))
    }
}

/// What the master saw of a finished transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completed {
    pub mosi: Vec<u16>,
    pub miso: Vec<u16>,
    /// Words clocked while the slave's transmit FIFO was empty.
    pub underruns: u32,
    pub aborted: bool,
}

impl Completed {
    pub fn miso_bytes(&self) -> Vec<u8> {
        self.miso.iter().map(|&w| w as u8).collect()
    }
}

/// Bus activity during one tick of an active transfer.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Clocking {
    /// The master starts shifting a new word out of the slave.
    pub shift_out: bool,
    pub falling_edge: bool,
    /// A word completed on MOSI and lands in the slave's receive FIFO.
    pub shifted_in: Option<u16>,
    pub finished: bool,
}

#[derive(Debug)]
struct Active {
    transfer: Transfer,
    bit_ticks: u64,
    started: u64,
    miso: Vec<u16>,
    underruns: u32,
}

#[derive(Debug, Default)]
pub(crate) struct Master {
    queue: std::collections::VecDeque<Transfer>,
    active: Option<Active>,
    armed_at: Option<u64>,
    idle_since: u64,
    completed: Vec<Completed>,
}

impl Master {
    pub fn enqueue(&mut self, transfer: Transfer) {
        self.queue.push_back(transfer);
    }

    pub fn pending(&self) -> bool {
        self.active.is_some() || !self.queue.is_empty()
    }

    pub fn chip_select(&self) -> bool {
        self.active.is_some()
    }

    pub fn completed(&self) -> &[Completed] {
        &self.completed
    }

    /// Drops interrupt-triggered transfers at the head of the queue. Called
    /// when the interrupt output stops being driven by the timer.
    pub fn cancel_interrupt_transfers(&mut self) {
        while self
            .queue
            .front()
            .is_some_and(|t| matches!(t.trigger, Trigger::OnInterrupt { .. }))
        {
            self.queue.pop_front();
        }
        self.armed_at = None;
    }

    /// Starts the next queued transfer if its trigger is satisfied.
    pub fn poll_start(&mut self, now: u64, interrupt_asserted: bool, default_bit_ticks: u64) {
        if self.active.is_some() {
            return;
        }
        let Some(next) = self.queue.front() else {
            return;
        };
        let due = match next.trigger {
            Trigger::AfterGap(gap) => now >= self.idle_since + gap,
            Trigger::OnInterrupt { delay } => {
                if self.armed_at.is_none() && interrupt_asserted {
                    self.armed_at = Some(now);
                }
                self.armed_at.is_some_and(|t| now >= t + delay)
            }
        };
        if !due {
            return;
        }
        let Some(transfer) = self.queue.pop_front() else {
            return;
        };
        self.armed_at = None;
        self.active = Some(Active {
            bit_ticks: transfer.bit_ticks.unwrap_or(default_bit_ticks).max(1),
            transfer,
            started: now,
            miso: Vec::new(),
            underruns: 0,
        });
    }

    /// Advances the active transfer to `now`.
    pub fn clock(&mut self, now: u64) -> Clocking {
        let mut out = Clocking::default();
        let Some(active) = self.active.as_ref() else {
            return out;
        };
        let rel = now - active.started;
        if rel < active.transfer.cs_setup {
            return out;
        }
        let t = rel - active.transfer.cs_setup;
        let bit_ticks = active.bit_ticks;
        let word_ticks = u64::from(active.transfer.bits) * bit_ticks;
        let word = (t / word_ticks) as usize;
        let offset = t % word_ticks;

        if t >= active.transfer.bits_to_clock() * bit_ticks {
            self.finish(now);
            out.finished = true;
            return out;
        }

        out.shift_out = offset == 0;
        out.falling_edge = offset % bit_ticks == bit_ticks / 2;
        if offset == word_ticks - 1 {
            let mask = ((1u32 << active.transfer.bits) - 1) as u16;
            out.shifted_in = Some(active.transfer.mosi[word] & mask);
        }
        out
    }

    /// Records the word the slave had at the head of its FIFO, or an
    /// underrun.
    pub fn shifted_out(&mut self, word: Option<u16>) {
        if let Some(active) = self.active.as_mut() {
            match word {
                Some(w) => active.miso.push(w),
                None => {
                    active.miso.push(0);
                    active.underruns += 1;
                }
            }
        }
    }

    fn finish(&mut self, now: u64) {
        if let Some(active) = self.active.take() {
            let aborted = active.transfer.bits_to_clock() < active.transfer.total_bits();
            self.completed.push(Completed {
                mosi: active.transfer.mosi,
                miso: active.miso,
                underruns: active.underruns,
                aborted,
            });
        }
        self.idle_since = now;
    }
}
