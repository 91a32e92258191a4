//! Clocks, `poll_oneoff` and `sched_yield`.

use std::time::Duration;

use weh_common::Errno;
use weh_common::abi::{eventtype, layout, subclockflags};
use weh_host::{ClockId, EmbedderHost};

use super::SyscallResult;
use crate::memory::MemoryView;
use crate::value::Args;

pub(super) fn clock_res_get(host: &mut EmbedderHost, memory: &mut MemoryView<'_>, args: Args<'_>) -> SyscallResult {
    let id = args.u32(0)?;
    let out = args.u32(1)?;
    memory.check(out, 8)?;

    let resolution = host.clock().resolution(ClockId::from_raw(id)?)?;
    memory.write_u64(out, resolution)?;
    Ok(())
}

pub(super) fn clock_time_get(
    host: &mut EmbedderHost,
    memory: &mut MemoryView<'_>,
    args: Args<'_>,
) -> SyscallResult {
    let id = args.u32(0)?;
    let out = args.u32(2)?;
    memory.check(out, 8)?;

    let now = host.clock().now(ClockId::from_raw(id)?)?;
    memory.write_u64(out, now)?;
    Ok(())
}

pub(super) fn sched_yield(_host: &mut EmbedderHost, _memory: &mut MemoryView<'_>, _args: Args<'_>) -> SyscallResult {
    std::thread::yield_now();
    Ok(())
}

/// A decoded subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Subscription {
    Clock {
        userdata: u64,
        id: u32,
        timeout: u64,
        flags: u16,
    },
    Fd {
        userdata: u64,
        kind: u8,
        fd: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Event {
    userdata: u64,
    error: Errno,
    kind: u8,
}

impl Event {
    fn encode(&self) -> [u8; layout::EVENT_SIZE as usize] {
        let mut out = [0u8; layout::EVENT_SIZE as usize];
        out[0..8].copy_from_slice(&self.userdata.to_le_bytes());
        out[8..10].copy_from_slice(&(self.error as u16).to_le_bytes());
        out[10] = self.kind;
        out
    }
}

fn read_subscription(memory: &MemoryView<'_>, addr: u32) -> Result<Subscription, super::SyscallError> {
    let userdata = memory.read_u64(addr)?;
    match memory.read_u8(addr + 8)? {
        eventtype::CLOCK => Ok(Subscription::Clock {
            userdata,
            id: memory.read_u32(addr + 16)?,
            timeout: memory.read_u64(addr + 24)?,
            flags: memory.read_u16(addr + 40)?,
        }),
        kind @ (eventtype::FD_READ | eventtype::FD_WRITE) => Ok(Subscription::Fd {
            userdata,
            kind,
            fd: memory.read_u32(addr + 16)?,
        }),
        _ => Err(Errno::Inval.into()),
    }
}

/// Wait for the earliest of a set of events.
///
/// Descriptor subscriptions are always ready, so they complete without
/// blocking. Otherwise the call sleeps until the nearest clock deadline and
/// reports every clock subscription due by then.
pub(super) fn poll_oneoff(host: &mut EmbedderHost, memory: &mut MemoryView<'_>, args: Args<'_>) -> SyscallResult {
    let input = args.u32(0)?;
    let output = args.u32(1)?;
    let count = args.u32(2)?;
    let nevents = args.u32(3)?;

    if count == 0 {
        return Err(Errno::Inval.into());
    }
    memory.check_array(input, count, layout::SUBSCRIPTION_SIZE)?;
    memory.check_array(output, count, layout::EVENT_SIZE)?;
    memory.check(nevents, 4)?;

    let subscriptions = (0..count)
        .map(|i| read_subscription(memory, input + i * layout::SUBSCRIPTION_SIZE))
        .collect::<Result<Vec<_>, _>>()?;

    let mut events = Vec::new();
    for sub in &subscriptions {
        if let Subscription::Fd { userdata, kind, fd } = *sub {
            let error = match host.fs().table().get(fd) {
                Ok(_) => Errno::Success,
                Err(errno) => errno,
            };
            events.push(Event { userdata, error, kind });
        }
    }

    if events.is_empty() {
        events = wait_for_clocks(host, &subscriptions);
    }

    for (index, event) in events.iter().enumerate() {
        memory.write_bytes(output + index as u32 * layout::EVENT_SIZE, &event.encode())?;
    }
    memory.write_u32(nevents, events.len() as u32)?;
    Ok(())
}

fn wait_for_clocks(host: &EmbedderHost, subscriptions: &[Subscription]) -> Vec<Event> {
    let clock = host.clock();
    let mut events = Vec::new();
    let mut pending = Vec::new();

    for sub in subscriptions {
        let Subscription::Clock {
            userdata,
            id,
            timeout,
            flags,
        } = *sub
        else {
            continue;
        };

        let remaining = ClockId::from_raw(id).and_then(|clock_id| {
            if flags & subclockflags::SUBSCRIPTION_CLOCK_ABSTIME != 0 {
                Ok(timeout.saturating_sub(clock.now(clock_id)?))
            } else {
                Ok(timeout)
            }
        });

        match remaining {
            Ok(nanos) => pending.push((userdata, nanos)),
            Err(error) => events.push(Event {
                userdata,
                error,
                kind: eventtype::CLOCK,
            }),
        }
    }

    if !events.is_empty() {
        return events;
    }

    if let Some(nearest) = pending.iter().map(|(_, nanos)| *nanos).min() {
        if nearest > 0 {
            clock.sleep(Duration::from_nanos(nearest));
        }
        events.extend(
            pending
                .iter()
                .filter(|(_, nanos)| *nanos <= nearest)
                .map(|(userdata, _)| Event {
                    userdata: *userdata,
                    error: Errno::Success,
                    kind: eventtype::CLOCK,
                }),
        );
    }
    events
}
