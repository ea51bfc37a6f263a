//! Synchronous message passing.
//!
//! Every process has a one-message mailbox. `send` drops a message into the target's
//! mailbox (replacing anything still unread) and wakes it; `recv` takes the message or
//! sleeps until one arrives. `send_recv` does both under one hold of the table lock, so a
//! reply cannot slip in between the send and the wait.

use crate::cpu::LockGuard;
use crate::hal::Hal;
use crate::param::MSG_WORDS;
use crate::proc::{Pid, ProcState, ProcTable, WaitChannel};
use crate::syscall::FAILURE;
use crate::trap::Trapframe;
use crate::Kernel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Message {
    pub regs: [u64; MSG_WORDS],
}

impl Message {
    /// Reads the message words out of the registers they travel in:
    /// rsi, rdx, r10, r8, r9, r12, r13, r14.
    #[must_use]
    pub fn from_frame(frame: &Trapframe) -> Self {
        Self {
            regs: [
                frame.rsi, frame.rdx, frame.r10, frame.r8, frame.r9, frame.r12, frame.r13,
                frame.r14,
            ],
        }
    }

    pub fn store(&self, frame: &mut Trapframe) {
        [
            frame.rsi, frame.rdx, frame.r10, frame.r8, frame.r9, frame.r12, frame.r13,
            frame.r14,
        ] = self.regs;
    }
}

/// A delivered message and who sent it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub from: Pid,
    pub message: Message,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    /// The target does not exist or cannot take messages
    NoSuchProcess,
    /// The receiver was killed while waiting
    Killed,
}

impl<H: Hal> Kernel<H> {
    /// Delivers `message` to `target` without waiting for it to be received.
    pub fn send(&self, target: Pid, message: Message) -> Result<(), IpcError> {
        let me = self.myproc();
        let mut table = self.lock_table();
        let from = table.procs[me].pid;
        deliver(&mut table, from, target, message)
    }

    /// Takes the next message for the calling process, sleeping until one arrives.
    pub fn recv(&self) -> Result<Envelope, IpcError> {
        let me = self.myproc();
        let table = self.lock_table();
        self.await_message(me, table)
    }

    /// Sends `message` to `target` and waits for the next message to the caller.
    pub fn send_recv(&self, target: Pid, message: Message) -> Result<Envelope, IpcError> {
        let me = self.myproc();
        let mut table = self.lock_table();
        let from = table.procs[me].pid;
        deliver(&mut table, from, target, message)?;
        self.await_message(me, table)
    }

    fn await_message<'a>(
        &'a self,
        me: usize,
        mut table: LockGuard<'a, H, ProcTable>,
    ) -> Result<Envelope, IpcError> {
        loop {
            if table.procs[me].killed {
                return Err(IpcError::Killed);
            }
            if let Some(envelope) = table.procs[me].mailbox.take() {
                return Ok(envelope);
            }
            let pid = table.procs[me].pid;
            table = self.sleep_locked(WaitChannel::Mailbox(pid), table);
        }
    }
}

fn deliver(
    table: &mut ProcTable,
    from: Pid,
    target: Pid,
    message: Message,
) -> Result<(), IpcError> {
    let slot = table
        .slot_of(target)
        .filter(|&slot| {
            matches!(
                table.procs[slot].state,
                ProcState::Runnable | ProcState::Running | ProcState::Sleeping
            )
        })
        .ok_or(IpcError::NoSuchProcess)?;
    table.procs[slot].mailbox = Some(Envelope { from, message });
    table.wakeup(WaitChannel::Mailbox(target));
    Ok(())
}

fn target(frame: &Trapframe) -> Option<Pid> {
    u32::try_from(frame.rdi).ok().map(Pid::new)
}

fn deliver_to_frame(received: Result<Envelope, IpcError>, frame: &mut Trapframe) -> u64 {
    match received {
        Ok(envelope) => {
            envelope.message.store(frame);
            u64::from(envelope.from.as_u32())
        }
        Err(_) => FAILURE,
    }
}

pub(crate) fn sys_send<H: Hal>(kernel: &Kernel<H>, frame: &mut Trapframe) -> u64 {
    let Some(target) = target(frame) else {
        return FAILURE;
    };
    match kernel.send(target, Message::from_frame(frame)) {
        Ok(()) => 0,
        Err(_) => FAILURE,
    }
}

pub(crate) fn sys_recv<H: Hal>(kernel: &Kernel<H>, frame: &mut Trapframe) -> u64 {
    deliver_to_frame(kernel.recv(), frame)
}

pub(crate) fn sys_send_recv<H: Hal>(kernel: &Kernel<H>, frame: &mut Trapframe) -> u64 {
    let Some(target) = target(frame) else {
        return FAILURE;
    };
    deliver_to_frame(kernel.send_recv(target, Message::from_frame(frame)), frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{self, Log};

    fn message(first: u64) -> Message {
        Message {
            regs: core::array::from_fn(|i| first + i as u64),
        }
    }

    #[test]
    fn message_words_travel_in_their_registers() {
        let mut frame = Trapframe::default();
        message(10).store(&mut frame);
        assert_eq!((frame.rsi, frame.r10, frame.r14), (10, 12, 17));
        assert_eq!(frame.rdi, 0);
        assert_eq!(Message::from_frame(&frame), message(10));
    }

    #[test]
    fn send_recv_round_trip() {
        let kernel = sim::boot();
        let log = Log::default();
        let out = log.clone();
        sim::start(kernel, move |u| {
            let server = u.fork(|s| loop {
                let (client, request) = s.recv();
                let mut reply = request;
                reply.regs[0] += 100;
                s.send(client, reply);
            });
            let (from, reply) = u.send_recv(server, message(1));
            out.push((from == server, reply));
            u.idle()
        });
        sim::run_until(kernel, || log.len() == 1);
        let mut expected = message(1);
        expected.regs[0] = 101;
        assert_eq!(log.snapshot(), vec![(true, expected)]);
    }

    #[test]
    fn unread_message_is_overwritten_by_the_next_send() {
        let kernel = sim::boot();
        let log = Log::default();
        let out = log.clone();
        sim::start(kernel, move |u| {
            let parent = u.getpid();
            let seen = out.clone();
            let child = u.fork(move |c| {
                let (_, first) = c.recv();
                seen.push(first.regs[0]);
                c.send(parent, message(0));
                let (_, second) = c.recv();
                seen.push(second.regs[0]);
                c.idle()
            });
            u.send(child, message(1));
            u.send(child, message(2));
            u.recv();
            u.send(child, message(3));
            u.idle()
        });
        sim::run_until(kernel, || log.len() == 2);
        assert_eq!(log.snapshot(), vec![2, 3]);
    }

    #[test]
    fn send_to_a_process_that_cannot_receive_fails() {
        let kernel = sim::boot();
        let log = Log::default();
        let out = log.clone();
        sim::start(kernel, move |u| {
            out.push(u.send(99, message(0)));
            let child = u.fork(|c| c.exit(0));
            u.yield_now();
            // Zombie until reaped
            out.push(u.send(child, message(0)));
            u.wait();
            out.push(u.send(child, message(0)));
            u.idle()
        });
        sim::run_until(kernel, || log.len() == 3);
        assert_eq!(log.snapshot(), vec![FAILURE; 3]);
    }

    #[test]
    fn killed_receiver_never_returns_to_user_mode() {
        let kernel = sim::boot();
        let log = Log::default();
        let out = log.clone();
        sim::start(kernel, move |u| {
            let seen = out.clone();
            let child = u.fork(move |c| {
                c.recv();
                seen.push("receiver resumed");
                c.idle()
            });
            u.yield_now();
            u.kill(child);
            u.send(child, message(5));
            let (_, status) = u.wait_status();
            out.push(if status == -1 { "receiver killed" } else { "wrong status" });
            u.idle()
        });
        sim::run_until(kernel, || log.len() == 1);
        assert_eq!(log.snapshot(), vec!["receiver killed"]);
    }
}
