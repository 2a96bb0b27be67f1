// SPDX-License-Identifier: MIT OR Apache-2.0
//! Basic node types: constants, watches, timers and event logging.

use crate::evaluation::NodeContext;
use crate::node::{ActionOptions, NodeBehavior, NodeError, NodeRegistry, NodeType};
use crate::slot::SlotType;
use serde_json::Value;

/// Constant number
pub const CONST_NUMBER_TYPE: &str = "basic/const";
/// Value inspector
pub const WATCH_TYPE: &str = "basic/watch";
/// Periodic event source
pub const TIMER_TYPE: &str = "events/timer";
/// Event sink that logs what it receives
pub const LOG_EVENT_TYPE: &str = "events/log";

pub(crate) fn register(registry: &mut NodeRegistry) {
    // Values
    registry.register(
        NodeType::new::<ConstNumber>(CONST_NUMBER_TYPE, "Const Number")
            .description("Outputs its value property")
            .output("value", "number")
            .property("value", 1.0),
    );
    registry.register(
        NodeType::new::<Watch>(WATCH_TYPE, "Watch")
            .description("Shows the value on its input")
            .input("value", SlotType::Default),
    );

    // Events
    registry.register(
        NodeType::new::<Timer>(TIMER_TYPE, "Timer")
            .description("Fires an event every interval")
            .output("on_tick", SlotType::Event)
            .property("interval", 1000)
            .property("event", "tick"),
    );
    registry.register(
        NodeType::new::<LogEvent>(LOG_EVENT_TYPE, "Log Event")
            .description("Logs every event it receives")
            .input("event", SlotType::Action),
    );
}

/// Outputs the number stored in its `value` property
#[derive(Debug, Default)]
pub struct ConstNumber;

impl NodeBehavior for ConstNumber {
    fn on_execute(&mut self, ctx: &mut NodeContext<'_>) -> Result<(), NodeError> {
        let value = match ctx.property("value") {
            Some(value) if value.is_number() => value.clone(),
            Some(other) => {
                return Err(NodeError::InvalidProperty {
                    name: "value".into(),
                    reason: format!("expected a number, got {other}"),
                })
            }
            None => Value::from(0.0),
        };
        ctx.set_output_data(0, value);
        Ok(())
    }
}

/// Keeps the last value seen on its input
#[derive(Debug, Default)]
pub struct Watch {
    value: Option<Value>,
}

impl Watch {
    /// Last observed value
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }
}

impl NodeBehavior for Watch {
    fn on_execute(&mut self, ctx: &mut NodeContext<'_>) -> Result<(), NodeError> {
        self.value = ctx.input_data(0);
        Ok(())
    }
}

/// Fires `on_tick` once a step whenever `interval` milliseconds of graph time have passed
#[derive(Debug, Default)]
pub struct Timer {
    accumulated: f64,
    ticks: u64,
}

impl Timer {
    /// Events fired so far
    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}

impl NodeBehavior for Timer {
    fn on_start(&mut self, _ctx: &mut NodeContext<'_>) {
        self.accumulated = 0.0;
    }

    fn on_execute(&mut self, ctx: &mut NodeContext<'_>) -> Result<(), NodeError> {
        let interval = ctx
            .property("interval")
            .and_then(Value::as_f64)
            .filter(|interval| *interval > 0.0)
            .ok_or_else(|| NodeError::InvalidProperty {
                name: "interval".into(),
                reason: "must be a positive number of milliseconds".into(),
            })?;
        let event = ctx.property("event").cloned().unwrap_or(Value::Null);

        // at most one tick per step; a stalled clock does not replay missed ticks
        self.accumulated += ctx.elapsed_time() * 1000.0;
        if self.accumulated >= interval {
            self.accumulated %= interval;
            self.ticks += 1;
            ctx.trigger_slot(0, &event)?;
        }
        Ok(())
    }
}

/// Counts and logs incoming events
#[derive(Debug, Default)]
pub struct LogEvent {
    count: usize,
    last: Option<Value>,
}

impl LogEvent {
    /// Events received
    pub fn count(&self) -> usize {
        self.count
    }

    /// Parameter of the last event
    pub fn last(&self) -> Option<&Value> {
        self.last.as_ref()
    }
}

impl NodeBehavior for LogEvent {
    fn accepts_actions(&self) -> bool {
        true
    }

    fn on_action(
        &mut self,
        ctx: &mut NodeContext<'_>,
        action: &str,
        param: &Value,
        _options: &ActionOptions,
    ) -> Result<(), NodeError> {
        self.count += 1;
        self.last = Some(param.clone());
        tracing::info!(node = %ctx.id(), action, %param, "event");
        Ok(())
    }
}
