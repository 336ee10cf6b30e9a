use std::time::Duration;

use super::IntervalCollector;
use crate::context::AgentContext;
use crate::datapoint::{MultiDataPoint, TagSet};
use crate::metadata::Hint;

pub const NAME: &str = "fake";

/// Emits `count` synthetic `test.fake` points every second, value `i` tagged
/// `i=<i>`.
pub fn fake(count: usize) -> IntervalCollector {
    IntervalCollector::new(NAME, move |ctx: &AgentContext, md: &mut MultiDataPoint| {
        md.reserve(count);
        for i in 0..count {
            let tags = TagSet::new().with("i", i.to_string());
            ctx.add(md, "test.fake", i, tags, Hint::NONE);
        }
        Ok(())
    })
    .with_interval(Duration::from_secs(1))
}
