use std::fmt;

use serde::{Deserialize, Serialize};

use super::{data_head, Channel};
use crate::error::{malformed, RelayError, RelayResult};

/// How a strength command changes the current value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrengthMode {
    Decrease,
    Increase,
    Set,
}

impl StrengthMode {
    pub fn code(self) -> u8 {
        match self {
            StrengthMode::Decrease => 0,
            StrengthMode::Increase => 1,
            StrengthMode::Set => 2,
        }
    }

    fn from_code(raw: &str) -> Option<Self> {
        match raw {
            "0" => Some(StrengthMode::Decrease),
            "1" => Some(StrengthMode::Increase),
            "2" => Some(StrengthMode::Set),
            _ => None,
        }
    }
}

/// Strength and limit of one channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrengthInfo {
    pub strength: u32,
    pub limit: u32,
}

/// Both channels as reported by the app
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrengthReport {
    pub a: StrengthInfo,
    pub b: StrengthInfo,
}

impl StrengthReport {
    pub fn channel(&self, channel: Channel) -> StrengthInfo {
        match channel {
            Channel::A => self.a,
            Channel::B => self.b,
        }
    }
}

/// Buttons on the app's feedback panel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedbackButton {
    A1,
    A2,
    A3,
    A4,
    A5,
    B1,
    B2,
    B3,
    B4,
    B5,
}

impl FeedbackButton {
    const ALL: [FeedbackButton; 10] = [
        FeedbackButton::A1,
        FeedbackButton::A2,
        FeedbackButton::A3,
        FeedbackButton::A4,
        FeedbackButton::A5,
        FeedbackButton::B1,
        FeedbackButton::B2,
        FeedbackButton::B3,
        FeedbackButton::B4,
        FeedbackButton::B5,
    ];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn channel(self) -> Channel {
        if self.index() < 5 {
            Channel::A
        } else {
            Channel::B
        }
    }
}

/// Body of a `msg` frame, parsed into a closed set of variants
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MsgPayload {
    /// `strength-{channel}+{mode}+{value}`, sent by the relay
    StrengthSet {
        channel: Channel,
        mode: StrengthMode,
        value: u32,
    },
    /// `strength-{a}+{b}+{limit_a}+{limit_b}`, sent by the app
    StrengthChanged(StrengthReport),
    /// `pulse-{A|B}:["0A0A0A0A00000000", ...]`
    Pulse { channel: Channel, frames: Vec<String> },
    /// `clear-{A|B}`
    Clear(Channel),
    /// `feedback-{button}`
    Feedback(FeedbackButton),
    /// Anything with an unknown head; kept verbatim
    Other(String),
}

impl MsgPayload {
    pub fn parse(raw: &str) -> RelayResult<Self> {
        let Some((head, body)) = raw.split_once('-') else {
            return Ok(MsgPayload::Other(raw.to_string()));
        };

        match head {
            data_head::STRENGTH => parse_strength(body),
            data_head::PULSE => {
                let (channel, frames) = body
                    .split_once(':')
                    .ok_or_else(|| malformed(format!("pulse payload without frames: {raw}")))?;
                let channel = parse_channel(channel)?;
                let frames: Vec<String> = serde_json::from_str(frames).map_err(malformed)?;
                Ok(MsgPayload::Pulse { channel, frames })
            }
            data_head::CLEAR => Ok(MsgPayload::Clear(parse_channel(body)?)),
            data_head::FEEDBACK => {
                let index: usize = body
                    .trim()
                    .parse()
                    .map_err(|_| malformed(format!("invalid feedback button: {body}")))?;
                FeedbackButton::from_index(index)
                    .map(MsgPayload::Feedback)
                    .ok_or_else(|| malformed(format!("unknown feedback button: {index}")))
            }
            _ => Ok(MsgPayload::Other(raw.to_string())),
        }
    }
}

fn parse_channel(raw: &str) -> RelayResult<Channel> {
    Channel::parse(raw.trim()).ok_or_else(|| malformed(format!("unknown channel: {raw}")))
}

fn parse_number(raw: &str) -> RelayResult<u32> {
    raw.trim()
        .parse()
        .map_err(|_| malformed(format!("invalid strength value: {raw}")))
}

fn parse_strength(body: &str) -> RelayResult<MsgPayload> {
    let parts: Vec<&str> = body.split('+').collect();
    match parts.as_slice() {
        [a, b, limit_a, limit_b] => Ok(MsgPayload::StrengthChanged(StrengthReport {
            a: StrengthInfo {
                strength: parse_number(a)?,
                limit: parse_number(limit_a)?,
            },
            b: StrengthInfo {
                strength: parse_number(b)?,
                limit: parse_number(limit_b)?,
            },
        })),
        [channel, mode, value] => {
            let mode = StrengthMode::from_code(mode.trim())
                .ok_or_else(|| malformed(format!("unknown strength mode: {mode}")))?;
            Ok(MsgPayload::StrengthSet {
                channel: parse_channel(channel)?,
                mode,
                value: parse_number(value)?,
            })
        }
        _ => Err(RelayError::MalformedMessage {
            reason: format!("unexpected strength payload: strength-{body}"),
        }),
    }
}

impl fmt::Display for MsgPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MsgPayload::StrengthSet {
                channel,
                mode,
                value,
            } => write!(
                f,
                "{}-{}+{}+{}",
                data_head::STRENGTH,
                channel.number(),
                mode.code(),
                value
            ),
            MsgPayload::StrengthChanged(report) => write!(
                f,
                "{}-{}+{}+{}+{}",
                data_head::STRENGTH,
                report.a.strength,
                report.b.strength,
                report.a.limit,
                report.b.limit
            ),
            MsgPayload::Pulse { channel, frames } => {
                let frames = serde_json::to_string(frames).map_err(|_| fmt::Error)?;
                write!(f, "{}-{}:{}", data_head::PULSE, channel.letter(), frames)
            }
            MsgPayload::Clear(channel) => {
                write!(f, "{}-{}", data_head::CLEAR, channel.letter())
            }
            MsgPayload::Feedback(button) => {
                write!(f, "{}-{}", data_head::FEEDBACK, button.index())
            }
            MsgPayload::Other(raw) => f.write_str(raw),
        }
    }
}
