use std::{collections::HashMap, time::Instant};

use futures::future::BoxFuture;
use tracing::{debug, warn};

use super::elements::{self, ElementContext, ElementError};
use crate::{
    data_model::{ExecutedNode, Flow, FlowElementKind, FlowId},
    utils::get_epoch_time_in_ms,
};

/// How a flow execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowResult {
    Completed,
    Failure(String),
    Canceled,
    MappingIssue(String),
    FlowNotFound(String),
}

/// Walks a flow graph following the output each part takes.
pub struct FlowExecutor {
    sub_flows: HashMap<FlowId, Flow>,
    max_parts: u32,
    counted: u32,
    total: u32,
    executed: Vec<ExecutedNode>,
}

impl FlowExecutor {
    pub fn new(sub_flows: Vec<Flow>, max_parts: u32) -> Self {
        Self {
            sub_flows: sub_flows.into_iter().map(|f| (f.uid.clone(), f)).collect(),
            max_parts,
            counted: 0,
            total: 0,
            executed: Vec::new(),
        }
    }

    /// Parts that count against the step budget.
    pub fn counted_steps(&self) -> u32 {
        self.counted
    }

    pub fn total_steps(&self) -> u32 {
        self.total
    }

    pub fn executed_nodes(&self) -> &[ExecutedNode] {
        &self.executed
    }

    pub fn into_executed_nodes(self) -> Vec<ExecutedNode> {
        self.executed
    }

    pub async fn execute(&mut self, flow: &Flow, ctx: &mut ElementContext) -> FlowResult {
        let total_parts = flow.parts.iter().filter(|p| p.element.is_counted()).count() as u32;
        ctx.progress.send_modify(|info| {
            info.total_parts = total_parts;
            info.flow_uid = Some(flow.uid.clone());
        });
        let result = self.run_flow(flow, ctx, 0).await;
        ctx.log.flush();
        result
    }

    fn run_flow<'a>(
        &'a mut self,
        flow: &'a Flow,
        ctx: &'a mut ElementContext,
        depth: u32,
    ) -> BoxFuture<'a, FlowResult> {
        Box::pin(async move {
            let Some(mut part) = flow.startup_part() else {
                return FlowResult::Failure(format!("Flow '{}' has no parts", flow.name));
            };

            loop {
                if ctx.cancel.is_cancelled() {
                    return FlowResult::Canceled;
                }

                self.total += 1;
                if part.element.is_counted() {
                    self.counted += 1;
                    if self.counted > self.max_parts {
                        let reason = format!(
                            "Exceeded maximum number of flow elements to execute: {}",
                            self.max_parts
                        );
                        ctx.log.error(&reason);
                        return FlowResult::Failure(reason);
                    }
                }

                let counted = self.counted;
                ctx.progress.send_modify(|info| {
                    info.step_additional_info();
                    info.current_part = counted;
                    info.current_part_name = part.display_name().to_string();
                    info.current_part_percent = 0.0;
                    info.depth = depth;
                    info.last_update = get_epoch_time_in_ms();
                });
                ctx.log.info(&format!("Executing flow element: {}", part.display_name()));
                ctx.log.flush();

                let started = Instant::now();
                let output = match &part.element {
                    FlowElementKind::SubFlow { flow_uid } => {
                        let Some(sub_flow) = self.sub_flows.get(flow_uid).cloned() else {
                            let reason = format!("Sub flow not found: {flow_uid}");
                            ctx.log.error(&reason);
                            return FlowResult::FlowNotFound(reason);
                        };
                        match self.run_flow(&sub_flow, ctx, depth + 1).await {
                            FlowResult::Completed => 1,
                            other => return other,
                        }
                    }
                    element => match elements::execute(element, ctx).await {
                        Ok(output) => output,
                        Err(ElementError::Canceled) => return FlowResult::Canceled,
                        Err(ElementError::Failed(reason)) => {
                            ctx.log.error(&format!("{} failed: {}", part.display_name(), reason));
                            ctx.failure_reason = Some(reason);
                            elements::FAILURE_OUTPUT
                        }
                    },
                };

                self.executed.push(ExecutedNode {
                    name: part.display_name().to_string(),
                    part_uid: part.uid.clone(),
                    element: part.element.name().to_string(),
                    output,
                    processing_time_ms: started.elapsed().as_millis() as u64,
                    depth,
                });
                debug!(part = %part.uid, output, depth, "flow element executed");

                if output < 0 {
                    let reason = ctx
                        .failure_reason
                        .take()
                        .unwrap_or_else(|| format!("Flow element '{}' failed", part.display_name()));
                    return FlowResult::Failure(reason);
                }
                if ctx.cancel.is_cancelled() {
                    return FlowResult::Canceled;
                }

                match part.connection(output) {
                    None => return FlowResult::Completed,
                    Some(target) => match flow.part(target) {
                        Some(next) => part = next,
                        None => {
                            warn!(target = %target, "flow connection points at a missing part");
                            return FlowResult::Failure(format!(
                                "Flow part not found: {target}"
                            ));
                        }
                    },
                }
            }
        })
    }
}
