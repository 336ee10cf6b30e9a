use std::path::Path;

use anyhow::{anyhow, Context, Result};

use super::IntervalCollector;
use crate::context::AgentContext;
use crate::datapoint::{MultiDataPoint, TagSet, Value};
use crate::metadata::{Hint, Unit};

pub const NAME: &str = "loadavg";

const LOADAVG: &str = "/proc/loadavg";

const DESC_LOAD: &str = "System load average over the period.";
const DESC_RUNNABLE: &str = "Currently runnable scheduling entities.";
const DESC_THREADS: &str = "Scheduling entities that exist on the system.";
const DESC_LAST_PID: &str = "Most recently created pid.";

/// Parses `/proc/loadavg`, e.g. `0.20 0.18 0.12 1/80 11206`.
pub fn parse_loadavg(text: &str, ctx: &AgentContext) -> Result<MultiDataPoint> {
    let fields: Vec<&str> = text.split_whitespace().collect();
    let [one, five, fifteen, sched, last_pid, ..] = fields.as_slice() else {
        return Err(anyhow!("unexpected loadavg format: {text:?}"));
    };
    let (runnable, threads) = sched
        .split_once('/')
        .ok_or_else(|| anyhow!("unexpected scheduling field {sched:?}"))?;

    let readings = [
        ("linux.loadavg_1_min", *one, Hint::gauge(Unit::Load, DESC_LOAD)),
        ("linux.loadavg_5_min", *five, Hint::gauge(Unit::Load, DESC_LOAD)),
        ("linux.loadavg_15_min", *fifteen, Hint::gauge(Unit::Load, DESC_LOAD)),
        ("linux.loadavg_runnable", runnable, Hint::gauge(Unit::Process, DESC_RUNNABLE)),
        ("linux.loadavg_total_threads", threads, Hint::gauge(Unit::Process, DESC_THREADS)),
        ("linux.loadavg_last_pid", *last_pid, Hint::gauge(Unit::None, DESC_LAST_PID)),
    ];

    let mut md = MultiDataPoint::with_capacity(readings.len());
    for (metric, raw, hint) in readings {
        let value: Value = raw.parse().with_context(|| format!("parsing {metric}"))?;
        ctx.add(&mut md, metric, value, TagSet::new(), hint);
    }
    Ok(md)
}

/// Samples `/proc/loadavg`; skipped on hosts without it.
pub fn loadavg() -> IntervalCollector {
    IntervalCollector::new(NAME, |ctx: &AgentContext, md: &mut MultiDataPoint| {
        let text = std::fs::read_to_string(LOADAVG).context("reading /proc/loadavg")?;
        md.extend(parse_loadavg(&text, ctx)?);
        Ok(())
    })
    .with_enabled(|| Path::new(LOADAVG).exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::export::health::HealthMetrics;

    fn ctx() -> AgentContext {
        let health = Arc::new(HealthMetrics::new("").expect("health metrics"));
        AgentContext::new("web01", health)
    }

    #[test]
    fn test_parse_loadavg() {
        let md = parse_loadavg("0.20 0.18 0.12 1/80 11206\n", &ctx()).expect("parse");
        let got: Vec<(&str, Value)> = md.iter().map(|dp| (dp.metric.as_str(), dp.value)).collect();
        assert_eq!(
            got,
            vec![
                ("linux.loadavg_1_min", Value::Float(0.20)),
                ("linux.loadavg_5_min", Value::Float(0.18)),
                ("linux.loadavg_15_min", Value::Float(0.12)),
                ("linux.loadavg_runnable", Value::Int(1)),
                ("linux.loadavg_total_threads", Value::Int(80)),
                ("linux.loadavg_last_pid", Value::Int(11206)),
            ]
        );
        assert!(md.iter().all(|dp| dp.tags.get("host") == Some("web01")));
    }

    #[test]
    fn test_parse_loadavg_malformed() {
        assert!(parse_loadavg("0.20 0.18", &ctx()).is_err());
        assert!(parse_loadavg("0.20 0.18 0.12 180 11206", &ctx()).is_err());
        assert!(parse_loadavg("a b c 1/2 3", &ctx()).is_err());
    }
}
