//! Software triggering on logic data.
//!
//! A [`Trigger`] is a list of stages, each a set of per-channel conditions.
//! [`SoftTrigger`] walks incoming logic samples through those stages and
//! fires once the last stage matches, releasing the samples it kept from
//! before that point.

use crate::acquisition::Acquisition;
use crate::datafeed::Packet;
use crate::device::{ChannelType, DeviceError, DeviceInfo};
use crate::logic::Logic;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitState {
    High,
    Low,
    DontCare,
}

/// Condition a single channel must meet on one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMatch {
    Zero,
    One,
    Rising,
    Falling,
    Edge,
}

impl TriggerMatch {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerMatch::Zero => "0",
            TriggerMatch::One => "1",
            TriggerMatch::Rising => "r",
            TriggerMatch::Falling => "f",
            TriggerMatch::Edge => "e",
        }
    }

    fn check(self, previous: Option<bool>, current: bool) -> bool {
        match (self, previous) {
            (TriggerMatch::Zero, _) => !current,
            (TriggerMatch::One, _) => current,
            (TriggerMatch::Rising, Some(prev)) => !prev && current,
            (TriggerMatch::Falling, Some(prev)) => prev && !current,
            (TriggerMatch::Edge, Some(prev)) => prev != current,
            (_, None) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelMatch {
    pub channel: usize,
    pub kind: TriggerMatch,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerStage {
    pub matches: Vec<ChannelMatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Trigger {
    stages: Vec<TriggerStage>,
}

impl Trigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts describing the first stage.
    pub fn start_capturing_when() -> StageBuilder {
        StageBuilder::new(Self::new())
    }

    /// Starts describing the stage that has to match after the current ones.
    pub fn then_when(self) -> StageBuilder {
        StageBuilder::new(self)
    }

    pub fn add_stage(&mut self, matches: Vec<ChannelMatch>) {
        self.stages.push(TriggerStage { matches });
    }

    pub fn stages(&self) -> &[TriggerStage] {
        &self.stages
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[derive(Debug)]
pub struct StageBuilder {
    trigger: Trigger,
    bit_states: Vec<(usize, BitState)>,
    raw: Vec<ChannelMatch>,
}

impl StageBuilder {
    fn new(trigger: Trigger) -> Self {
        Self {
            trigger,
            bit_states: Vec::new(),
            raw: Vec::new(),
        }
    }

    /// Sets the level `channel` has to be at. `DontCare` drops an earlier
    /// setting.
    pub fn bit(mut self, channel: usize, state: BitState) -> Self {
        self.bit_states.retain(|(c, _)| *c != channel);
        if state != BitState::DontCare {
            self.bit_states.push((channel, state));
        }
        self
    }

    /// Adds a raw condition, e.g. an edge on a channel whose level does not
    /// matter otherwise.
    pub fn channel(mut self, channel: usize, kind: TriggerMatch) -> Self {
        self.raw.push(ChannelMatch { channel, kind });
        self
    }

    /// Matches while the bits are at their levels.
    pub fn is_matching(self) -> Trigger {
        self.finish(|state| match state {
            BitState::High => TriggerMatch::One,
            _ => TriggerMatch::Zero,
        })
    }

    /// Matches on the sample where the bits change to their levels.
    pub fn starts_matching(self) -> Trigger {
        self.finish(|state| match state {
            BitState::High => TriggerMatch::Rising,
            _ => TriggerMatch::Falling,
        })
    }

    /// Matches on the sample where the bits leave their levels.
    pub fn stops_matching(self) -> Trigger {
        self.finish(|state| match state {
            BitState::High => TriggerMatch::Falling,
            _ => TriggerMatch::Rising,
        })
    }

    fn finish(self, to_match: impl Fn(BitState) -> TriggerMatch) -> Trigger {
        let mut trigger = self.trigger;
        let mut matches: Vec<ChannelMatch> = self
            .bit_states
            .into_iter()
            .map(|(channel, state)| ChannelMatch {
                channel,
                kind: to_match(state),
            })
            .collect();
        matches.extend(self.raw);
        trigger.add_stage(matches);
        trigger
    }
}

/// Where a trigger fired in the buffer handed to [`SoftTrigger::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerHit {
    /// Index of the first sample after the pre-trigger data.
    pub offset: usize,
    /// Samples released from the pre-trigger buffer.
    pub pre_trigger_samples: usize,
}

#[derive(Debug)]
pub struct SoftTrigger {
    stages: Vec<Vec<ChannelMatch>>,
    unitsize: usize,
    cur_stage: usize,
    previous: Option<Vec<u8>>,
    pre_trigger: VecDeque<u8>,
    pre_trigger_capacity: usize,
    fired: bool,
}

fn level(sample: &[u8], channel: usize) -> bool {
    sample
        .get(channel / 8)
        .is_some_and(|byte| (byte >> (channel % 8)) & 1 == 1)
}

impl SoftTrigger {
    /// Prepares `trigger` for the logic channels of `info`. Conditions on
    /// disabled channels are dropped.
    pub fn new(
        trigger: &Trigger,
        info: &DeviceInfo,
        unitsize: usize,
        pre_trigger_samples: usize,
    ) -> Result<Self, DeviceError> {
        if trigger.is_empty() {
            return Err(DeviceError::Argument("trigger has no stages".into()));
        }
        let mut stages = Vec::with_capacity(trigger.stages().len());
        for stage in trigger.stages() {
            let mut matches = Vec::with_capacity(stage.matches.len());
            for m in &stage.matches {
                let channel = info
                    .channel(m.channel)
                    .filter(|c| c.kind == ChannelType::Logic && m.channel < unitsize * 8)
                    .ok_or_else(|| {
                        DeviceError::Argument(format!("no logic channel {} to trigger on", m.channel))
                    })?;
                if channel.enabled {
                    matches.push(*m);
                }
            }
            stages.push(matches);
        }

        let capacity = pre_trigger_samples.saturating_mul(unitsize);
        let mut pre_trigger = VecDeque::new();
        pre_trigger.try_reserve(capacity).map_err(|e| {
            DeviceError::ResourceExhaustion(format!(
                "pre-trigger buffer of {pre_trigger_samples} samples: {e}"
            ))
        })?;

        Ok(Self {
            stages,
            unitsize,
            cur_stage: 0,
            previous: None,
            pre_trigger,
            pre_trigger_capacity: capacity,
            fired: false,
        })
    }

    pub fn fired(&self) -> bool {
        self.fired
    }

    fn stage_matches(&self, stage: usize, sample: &[u8]) -> bool {
        self.stages[stage].iter().all(|m| {
            let previous = self.previous.as_deref().map(|p| level(p, m.channel));
            m.kind.check(previous, level(sample, m.channel))
        })
    }

    fn remember(&mut self, sample: &[u8]) {
        if self.pre_trigger_capacity > 0 {
            if self.pre_trigger.len() + sample.len() > self.pre_trigger_capacity {
                self.pre_trigger.drain(..sample.len());
            }
            self.pre_trigger.extend(sample.iter().copied());
        }
        match &mut self.previous {
            Some(previous) => previous.copy_from_slice(sample),
            None => self.previous = Some(sample.to_vec()),
        }
    }

    /// Scans `data` for the trigger. When it fires, the pre-trigger samples
    /// and a TRIGGER packet are sent through `acq`, and the returned hit
    /// tells the caller where its own data starts. Once fired, every call
    /// returns a hit at offset 0.
    pub fn check(
        &mut self,
        acq: &mut Acquisition<'_>,
        data: &[u8],
    ) -> Result<Option<TriggerHit>, DeviceError> {
        if self.fired {
            return Ok(Some(TriggerHit {
                offset: 0,
                pre_trigger_samples: 0,
            }));
        }
        let logic = Logic::new(self.unitsize, data.to_vec())?;

        for (index, sample) in logic.samples().iter().enumerate() {
            let mut matched = self.stage_matches(self.cur_stage, sample);
            if !matched && self.cur_stage > 0 {
                // Partial sequence broken: start over on this sample.
                self.cur_stage = 0;
                matched = self.stage_matches(0, sample);
            }
            if matched {
                self.cur_stage += 1;
                if self.cur_stage == self.stages.len() {
                    return self.fire(acq, index).map(Some);
                }
            }
            self.remember(sample);
        }
        Ok(None)
    }

    fn fire(&mut self, acq: &mut Acquisition<'_>, offset: usize) -> Result<TriggerHit, DeviceError> {
        self.fired = true;
        let buffered: Vec<u8> = self.pre_trigger.drain(..).collect();
        let pre_trigger_samples = buffered.len() / self.unitsize;
        log::debug!("Trigger fired at sample {offset} with {pre_trigger_samples} pre-trigger samples.");
        if !buffered.is_empty() {
            acq.send(Logic::new(self.unitsize, buffered)?);
        }
        acq.send(Packet::Trigger);
        Ok(TriggerHit {
            offset,
            pre_trigger_samples,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datafeed::PacketKind;
    use crate::pipeline::Pipeline;
    use crate::sw_limits::SoftwareLimits;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn logic_device(channels: usize) -> DeviceInfo {
        let mut info = DeviceInfo::new("test", "Acme", "Logic");
        for i in 0..channels {
            info.add_channel(ChannelType::Logic, &format!("D{i}"));
        }
        info
    }

    fn run(
        soft: &mut SoftTrigger,
        info: &DeviceInfo,
        chunks: &[&[u8]],
    ) -> (Vec<Option<TriggerHit>>, Vec<Packet>) {
        let mut limits = SoftwareLimits::new();
        let mut pipeline = Pipeline::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink_seen = Rc::clone(&seen);
        pipeline.add_sink(move |_: &DeviceInfo, p: &Packet| sink_seen.borrow_mut().push(p.clone()));

        let mut hits = Vec::new();
        for chunk in chunks {
            let mut acq = Acquisition::new(info, None, &mut limits, &mut pipeline, None);
            hits.push(soft.check(&mut acq, chunk).unwrap());
        }
        let packets = seen.borrow().clone();
        (hits, packets)
    }

    #[test]
    fn test_builder_translates_bit_states() {
        let trigger = Trigger::start_capturing_when()
            .bit(0, BitState::High)
            .bit(1, BitState::Low)
            .bit(2, BitState::High)
            .bit(2, BitState::DontCare)
            .starts_matching()
            .then_when()
            .channel(3, TriggerMatch::Edge)
            .is_matching();

        assert_eq!(trigger.stages().len(), 2);
        assert_eq!(
            trigger.stages()[0].matches,
            vec![
                ChannelMatch { channel: 0, kind: TriggerMatch::Rising },
                ChannelMatch { channel: 1, kind: TriggerMatch::Falling },
            ]
        );
        assert_eq!(trigger.stages()[1].matches[0].kind.as_str(), "e");
    }

    #[test]
    fn test_rising_edge_releases_pre_trigger_samples() {
        let info = logic_device(8);
        let trigger = Trigger::start_capturing_when()
            .bit(0, BitState::High)
            .starts_matching();
        let mut soft = SoftTrigger::new(&trigger, &info, 1, 2).unwrap();

        let (hits, packets) = run(&mut soft, &info, &[&[0, 0, 0, 1, 1]]);
        assert_eq!(
            hits[0],
            Some(TriggerHit {
                offset: 3,
                pre_trigger_samples: 2
            })
        );
        assert_eq!(packets.len(), 2);
        let Packet::Logic(pre) = &packets[0] else {
            unreachable!("pre-trigger data comes first");
        };
        assert_eq!(pre.data(), &[0, 0]);
        assert_eq!(packets[1].kind(), PacketKind::Trigger);
        assert!(soft.fired());
    }

    #[test]
    fn test_edge_spans_buffers() {
        let info = logic_device(8);
        let trigger = Trigger::start_capturing_when()
            .bit(1, BitState::Low)
            .starts_matching();
        let mut soft = SoftTrigger::new(&trigger, &info, 1, 0).unwrap();

        let (hits, packets) = run(&mut soft, &info, &[&[0x02, 0x02], &[0x00, 0x02]]);
        assert_eq!(hits[0], None);
        assert_eq!(
            hits[1],
            Some(TriggerHit {
                offset: 0,
                pre_trigger_samples: 0
            })
        );
        assert_eq!(packets.iter().map(Packet::kind).collect::<Vec<_>>(), vec![PacketKind::Trigger]);
    }

    #[test]
    fn test_broken_sequence_restarts_at_first_stage() {
        let info = logic_device(8);
        let trigger = Trigger::start_capturing_when()
            .bit(0, BitState::High)
            .is_matching()
            .then_when()
            .bit(1, BitState::High)
            .is_matching();
        let mut soft = SoftTrigger::new(&trigger, &info, 1, 0).unwrap();

        let (hits, _) = run(&mut soft, &info, &[&[0x01, 0x00, 0x01, 0x03]]);
        assert_eq!(hits[0].map(|h| h.offset), Some(3));
    }

    #[test]
    fn test_disabled_channels_are_ignored() {
        let mut info = logic_device(8);
        info.channels[1].enabled = false;
        let trigger = Trigger::start_capturing_when()
            .bit(0, BitState::High)
            .bit(1, BitState::High)
            .is_matching();
        let mut soft = SoftTrigger::new(&trigger, &info, 1, 0).unwrap();

        let (hits, _) = run(&mut soft, &info, &[&[0x00, 0x01]]);
        assert_eq!(hits[0].map(|h| h.offset), Some(1));
    }

    #[test]
    fn test_rejects_unknown_channels() {
        let info = logic_device(4);
        let trigger = Trigger::start_capturing_when()
            .bit(6, BitState::High)
            .is_matching();
        assert!(matches!(
            SoftTrigger::new(&trigger, &info, 1, 0),
            Err(DeviceError::Argument(_))
        ));
        assert!(SoftTrigger::new(&Trigger::new(), &info, 1, 0).is_err());
    }
}
