//! Inter-container buffering for a single output, computed offline.

use cadence_core::icb::{IcbInputs, IcbLocal, IcbPolicy, negotiate};
use cadence_core::{DataFormat, FrameLength, IcbInfo, IcbMode, IcbResult, Scenario};
use clap::{Args, ValueEnum};

/// Data format flowing through the output.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum FormatArg {
    /// Linear PCM
    Pcm,
    /// Packetized data with PCM timing
    Packetized,
    /// Raw compressed bitstream
    RawCompressed,
}

impl From<FormatArg> for DataFormat {
    fn from(f: FormatArg) -> Self {
        match f {
            FormatArg::Pcm => DataFormat::Pcm,
            FormatArg::Packetized => DataFormat::Packetized,
            FormatArg::RawCompressed => DataFormat::RawCompressed,
        }
    }
}

/// Compute the buffers an external output circulates to its downstream.
#[derive(Args)]
pub struct NegotiateArgs {
    /// Own frame length in microseconds
    #[arg(long, default_value = "1000")]
    pub own_us: u32,

    /// Own period in microseconds
    #[arg(long, default_value = "0")]
    pub own_period_us: u32,

    /// Own side is real time
    #[arg(long)]
    pub own_rt: bool,

    /// Downstream frame length in microseconds (omit for no report yet)
    #[arg(long)]
    pub ds_us: Option<u32>,

    /// Downstream period in microseconds
    #[arg(long, default_value = "0")]
    pub ds_period_us: u32,

    /// Downstream is real time
    #[arg(long)]
    pub ds_rt: bool,

    /// Downstream accepts partial frames
    #[arg(long)]
    pub ds_variable: bool,

    /// Downstream consumes from a single buffer
    #[arg(long)]
    pub single_buffer: bool,

    /// Never send a one-time prebuffer
    #[arg(long)]
    pub disable_otp: bool,

    /// Both sides run the voice scenario
    #[arg(long)]
    pub voice: bool,

    /// The output has no downstream peer
    #[arg(long)]
    pub unconnected: bool,

    /// Data format
    #[arg(long, value_enum, default_value = "pcm")]
    pub format: FormatArg,

    /// Regular buffers when nothing forces more
    #[arg(long, default_value = "2")]
    pub reg_bufs: u32,

    /// Print the result as JSON
    #[arg(long)]
    pub json: bool,
}

impl NegotiateArgs {
    fn inputs(&self) -> IcbInputs {
        let scenario = if self.voice {
            Scenario::Voice
        } else {
            Scenario::Default
        };
        IcbInputs {
            connected: !self.unconnected,
            format: self.format.into(),
            local: IcbLocal {
                frame: FrameLength::from_us(self.own_us),
                period_us: self.own_period_us,
                real_time: self.own_rt,
                disable_otp: self.disable_otp,
                scenario,
            },
            downstream: self.ds_us.map(|us| IcbInfo {
                frame: FrameLength::from_us(us),
                period_us: self.ds_period_us,
                variable_input: self.ds_variable,
                real_time: self.ds_rt,
                single_buffer_mode: self.single_buffer,
                scenario,
            }),
        }
    }
}

fn mode_name(mode: IcbMode) -> &'static str {
    match mode {
        IcbMode::Deferred => "deferred",
        IcbMode::RawCompressed => "raw_compressed",
        IcbMode::Negotiated => "negotiated",
    }
}

/// Run the negotiate command.
pub fn run(args: NegotiateArgs) -> anyhow::Result<()> {
    let policy = IcbPolicy {
        default_reg_bufs: args.reg_bufs,
        ..IcbPolicy::default()
    };
    let result = negotiate(&args.inputs(), &policy);
    tracing::debug!(?result, "negotiated");

    if args.json {
        println!("{}", serde_json::to_string_pretty(&to_json(&result))?);
    } else {
        println!("Mode:        {}", mode_name(result.mode));
        println!("Regular:     {}", result.reg_bufs);
        println!("Prebuffers:  {}", result.prebufs);
        println!("One-time:    {} us", result.otp_us);
        println!("Total:       {}", result.total_bufs());
    }
    Ok(())
}

fn to_json(result: &IcbResult) -> serde_json::Value {
    serde_json::json!({
        "mode": mode_name(result.mode),
        "reg_bufs": result.reg_bufs,
        "prebufs": result.prebufs,
        "otp_us": result.otp_us,
        "total_bufs": result.total_bufs(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        args: NegotiateArgs,
    }

    fn parse(argv: &[&str]) -> NegotiateArgs {
        Wrapper::parse_from(std::iter::once("negotiate").chain(argv.iter().copied())).args
    }

    #[test]
    fn missing_downstream_report_defers() {
        let args = parse(&["--own-us", "5000"]);
        let inputs = args.inputs();
        assert!(inputs.downstream.is_none());
        assert!(negotiate(&inputs, &IcbPolicy::default()).is_deferred());
    }

    #[test]
    fn flags_reach_both_sides() {
        let args = parse(&[
            "--own-us", "1000", "--ds-us", "2500", "--own-rt", "--ds-rt", "--voice",
        ]);
        let inputs = args.inputs();
        assert!(inputs.local.real_time);
        assert_eq!(inputs.local.scenario, Scenario::Voice);
        let ds = inputs.downstream.unwrap();
        assert_eq!(ds.frame.us, 2_500);
        assert!(ds.real_time);
    }

    #[test]
    fn json_report_carries_totals() {
        let result = IcbResult {
            mode: IcbMode::Negotiated,
            reg_bufs: 3,
            prebufs: 1,
            otp_us: 0,
        };
        let v = to_json(&result);
        assert_eq!(v["mode"], "negotiated");
        assert_eq!(v["total_bufs"], 4);
    }
}
