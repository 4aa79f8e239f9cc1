//! The stateful half of the coordinator (spec §4.7): pairs readings on the
//! same road into candidate tickets, and enforces that at most one ticket
//! ever covers a given (plate, day).
//!
//! Lives behind the single `run` select loop as plain owned state — spec
//! §9 calls this out as global mutable state that belongs to one
//! coordinator task reached only by message passing, so nothing here needs
//! its own locking.

use std::collections::{HashMap, HashSet};

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::wire::{self, TaggedMessage, WriteTo};

const SECONDS_PER_DAY: u32 = 86400;

/// A single (plate, timestamp) observation, combined with the reporting
/// camera's road, mile marker, and speed limit.
#[derive(Debug, Clone)]
pub struct Plate {
    pub plate: String,
    pub road: u16,
    pub limit: u16,
    pub mile: u16,
    pub timestamp: u32,
}

/// A server-emitted overspeed record. `mile1`/`timestamp1` is always the
/// earlier of the two observations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub plate: String,
    pub road: u16,
    pub mile1: u16,
    pub timestamp1: u32,
    pub mile2: u16,
    pub timestamp2: u32,
    pub speed: u16,
}

impl TaggedMessage for Ticket {
    const TAG: u8 = 0x21;
}

impl WriteTo for Ticket {
    async fn write_to<W>(&self, write: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        write.write_u8(Self::TAG).await?;
        wire::write_str(write, &self.plate).await?;
        write.write_u16(self.road).await?;
        write.write_u16(self.mile1).await?;
        write.write_u32(self.timestamp1).await?;
        write.write_u16(self.mile2).await?;
        write.write_u32(self.timestamp2).await?;
        write.write_u16(self.speed).await
    }
}

/// Observation history plus issued-day bookkeeping for the whole network.
#[derive(Default)]
pub struct Controller {
    /// Every reading seen so far, keyed by (road, plate) so a new reading
    /// is checked against every earlier one on that road, not just the
    /// most recent — cameras can be skipped and plates reappear later.
    readings: HashMap<(u16, String), Vec<(u16, u32)>>,
    /// (plate, day) pairs already covered by some delivered-or-queued
    /// ticket. Reserved at decision time, before the ticket is ever handed
    /// to a dispatcher.
    issued_days: HashMap<String, HashSet<u32>>,
}

impl Controller {
    /// Record `plate` and return every newly-generated, non-suppressed
    /// ticket it causes when paired against this road's prior readings.
    pub fn signal(&mut self, plate: Plate) -> Vec<Ticket> {
        let Plate { plate: number, road, limit, mile, timestamp } = plate;

        let mut tickets = Vec::new();
        let key = (road, number.clone());
        let prior = self.readings.entry(key).or_default();

        for &(other_mile, other_timestamp) in prior.iter() {
            if let Some(ticket) = candidate_ticket(&number, road, limit, mile, timestamp, other_mile, other_timestamp) {
                if self.reserve(&ticket) {
                    tickets.push(ticket);
                }
            }
        }

        prior.push((mile, timestamp));
        tickets
    }

    /// Reserve every day `ticket` covers, unless one is already reserved
    /// for this plate, in which case the ticket is suppressed and no days
    /// are touched.
    fn reserve(&mut self, ticket: &Ticket) -> bool {
        let first_day = ticket.timestamp1 / SECONDS_PER_DAY;
        let last_day = ticket.timestamp2 / SECONDS_PER_DAY;
        let days = self.issued_days.entry(ticket.plate.clone()).or_default();

        if (first_day..=last_day).any(|day| days.contains(&day)) {
            return false;
        }
        days.extend(first_day..=last_day);
        true
    }
}

/// Build a ticket from two readings of the same plate on the same road, if
/// their average speed exceeds `limit`. Skips pairs with zero distance or
/// zero elapsed time — no speed can be inferred from either.
fn candidate_ticket(
    plate: &str,
    road: u16,
    limit: u16,
    mile_a: u16,
    ts_a: u32,
    mile_b: u16,
    ts_b: u32,
) -> Option<Ticket> {
    let distance = u64::from(mile_a.abs_diff(mile_b));
    let elapsed = u64::from(ts_a.abs_diff(ts_b));
    if distance == 0 || elapsed == 0 {
        return None;
    }

    // round(3600 * 100 * distance / elapsed), with a half-up rounding
    // correction folded into the numerator rather than done in floating
    // point.
    let speed_hundredths = (3600 * 100 * distance + elapsed / 2) / elapsed;
    if speed_hundredths <= u64::from(limit) * 100 {
        return None;
    }

    let speed = u16::try_from(speed_hundredths).unwrap_or(u16::MAX);

    let (mile1, timestamp1, mile2, timestamp2) = if ts_a <= ts_b {
        (mile_a, ts_a, mile_b, ts_b)
    } else {
        (mile_b, ts_b, mile_a, ts_a)
    };

    Some(Ticket {
        plate: plate.to_string(),
        road,
        mile1,
        timestamp1,
        mile2,
        timestamp2,
        speed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(plate: &str, road: u16, limit: u16, mile: u16, timestamp: u32) -> Plate {
        Plate {
            plate: plate.to_string(),
            road,
            limit,
            mile,
            timestamp,
        }
    }

    #[test]
    fn single_overspeed_pair_produces_one_ticket() {
        let mut controller = Controller::default();

        assert!(controller.signal(reading("UN1X", 123, 60, 8, 0)).is_empty());
        let tickets = controller.signal(reading("UN1X", 123, 60, 9, 45));

        assert_eq!(
            tickets,
            vec![Ticket {
                plate: "UN1X".to_string(),
                road: 123,
                mile1: 8,
                timestamp1: 0,
                mile2: 9,
                timestamp2: 45,
                speed: 8000,
            }]
        );
    }

    #[test]
    fn under_limit_pair_produces_no_ticket() {
        let mut controller = Controller::default();
        controller.signal(reading("UN1X", 123, 60, 8, 0));
        let tickets = controller.signal(reading("UN1X", 123, 60, 9, 90));
        assert!(tickets.is_empty());
    }

    #[test]
    fn out_of_order_arrival_still_normalizes_earlier_reading_first() {
        let mut controller = Controller::default();

        // The later observation (by timestamp) is reported to the server
        // first; the earlier one arrives second.
        assert!(controller.signal(reading("UN1X", 123, 60, 9, 45)).is_empty());
        let tickets = controller.signal(reading("UN1X", 123, 60, 8, 0));

        assert_eq!(
            tickets,
            vec![Ticket {
                plate: "UN1X".to_string(),
                road: 123,
                mile1: 8,
                timestamp1: 0,
                mile2: 9,
                timestamp2: 45,
                speed: 8000,
            }]
        );
    }

    #[test]
    fn ticket_suppressed_when_its_day_is_already_reserved() {
        let mut controller = Controller::default();

        controller.signal(reading("UN1X", 123, 60, 0, 0));
        let first = controller.signal(reading("UN1X", 123, 60, 100, 10));
        assert_eq!(first.len(), 1);

        // A second overspeed pair for the same plate, same day, must not
        // produce a second ticket.
        controller.signal(reading("UN1X", 123, 60, 200, 20));
        let second = controller.signal(reading("UN1X", 123, 60, 300, 30));
        assert!(second.is_empty());
    }

    #[test]
    fn different_days_each_get_their_own_ticket() {
        let mut controller = Controller::default();

        controller.signal(reading("UN1X", 123, 60, 0, 0));
        let day0 = controller.signal(reading("UN1X", 123, 60, 100, 10));
        assert_eq!(day0.len(), 1);

        controller.signal(reading("UN1X", 123, 60, 0, SECONDS_PER_DAY + 1000));
        let day1 = controller.signal(reading("UN1X", 123, 60, 100, SECONDS_PER_DAY + 1010));
        assert_eq!(day1.len(), 1);
    }
}
