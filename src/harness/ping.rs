//! Ping output parsing
//!
//! Extracts the statistics line printed at the end of a ping run, e.g.
//! `1 packets transmitted, 1 received, 0% packet loss, time 0ms`.
//! Both iputils and busybox wording are recognized.

use nom::{
    Parser,
    branch::alt,
    bytes::complete::tag,
    character::complete::{char, digit1, space0},
    combinator::{map_res, opt, recognize},
    sequence::{delimited, pair},
};

/// Packet counts from a ping statistics line
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PingSummary {
    pub transmitted: u32,
    pub received: u32,
    pub loss_percent: f64,
}

impl PingSummary {
    /// Every packet sent came back
    pub fn lossless(&self) -> bool {
        self.transmitted > 0 && self.received == self.transmitted && self.loss_percent == 0.0
    }
}

/// Find and parse the statistics line in raw ping output
pub fn parse_summary(output: &str) -> Option<PingSummary> {
    output
        .lines()
        .map(str::trim)
        .find_map(|line| summary_line(line).ok().map(|(_, summary)| summary))
}

fn count(input: &str) -> nom::IResult<&str, u32> {
    map_res(digit1, str::parse::<u32>).parse(input)
}

fn summary_line(input: &str) -> nom::IResult<&str, PingSummary> {
    let (input, transmitted) = count(input)?;
    let (input, _) = tag(" packets transmitted, ").parse(input)?;
    let (input, received) = count(input)?;
    let (input, _) = alt((tag(" packets received,"), tag(" received,"))).parse(input)?;
    // iputils reports errors before the loss figure: "+1 errors,"
    let (input, _) = opt(delimited(tag(" +"), digit1, tag(" errors,"))).parse(input)?;
    let (input, _) = space0.parse(input)?;
    let (input, loss_percent) = map_res(
        recognize(pair(digit1, opt(pair(char('.'), digit1)))),
        str::parse::<f64>,
    )
    .parse(input)?;
    let (input, _) = tag("% packet loss").parse(input)?;

    Ok((
        input,
        PingSummary {
            transmitted,
            received,
            loss_percent,
        },
    ))
}
