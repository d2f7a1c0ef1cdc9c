//! Pass ordering and render-target lifetimes.
//!
//! Each pass declares the targets it samples and the targets it renders
//! into. A plan is valid when no pass samples a target it also renders into,
//! and every sampled target was rendered earlier in the same frame.
//! Targets may be reused by later passes once their previous contents are no
//! longer needed (the blur intermediate is written three times per frame).

use crate::config::RenderStyle;
use crate::error::PipelineError;

/// Every intermediate and final target the pipeline touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    /// Per-pixel `(type_color, instance_id, view_z, frag_depth)`.
    AgentInfo,
    Normal,
    Position,
    GBufferDepth,
    Ssao1,
    Ssao2,
    Ssao1Blurred,
    Ssao2Blurred,
    BlurIntermediate,
    /// Depth written by the contour pass for overlay depth testing.
    OverlayDepth,
    /// The caller's color target.
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occlusion {
    Near,
    Far,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlurAxis {
    Horizontal,
    Vertical,
}

/// What a pass does. Inputs and outputs follow from the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    GBuffer,
    Ssao(Occlusion),
    Blur(Occlusion, BlurAxis),
    /// Fill the blurred occlusion targets with "unoccluded".
    ClearOcclusion,
    Composite,
    Contour,
    /// Path lines and the bounding box, depth tested against `OverlayDepth`.
    Overlay,
}

impl PassKind {
    pub fn name(&self) -> &'static str {
        match self {
            PassKind::GBuffer => "gbuffer",
            PassKind::Ssao(Occlusion::Near) => "ssao1",
            PassKind::Ssao(Occlusion::Far) => "ssao2",
            PassKind::Blur(Occlusion::Near, BlurAxis::Horizontal) => "blur1_h",
            PassKind::Blur(Occlusion::Near, BlurAxis::Vertical) => "blur1_v",
            PassKind::Blur(Occlusion::Far, BlurAxis::Horizontal) => "blur2_h",
            PassKind::Blur(Occlusion::Far, BlurAxis::Vertical) => "blur2_v",
            PassKind::ClearOcclusion => "clear_occlusion",
            PassKind::Composite => "composite",
            PassKind::Contour => "contour",
            PassKind::Overlay => "overlay",
        }
    }

    pub fn inputs(&self) -> Vec<Target> {
        match self {
            PassKind::GBuffer | PassKind::ClearOcclusion => vec![],
            PassKind::Ssao(_) => vec![Target::Normal, Target::Position],
            PassKind::Blur(o, BlurAxis::Horizontal) => vec![raw_ao(*o), Target::Position],
            PassKind::Blur(_, BlurAxis::Vertical) => {
                vec![Target::BlurIntermediate, Target::Position]
            }
            PassKind::Composite => vec![
                Target::AgentInfo,
                Target::Ssao1Blurred,
                Target::Ssao2Blurred,
            ],
            PassKind::Contour => vec![Target::BlurIntermediate, Target::AgentInfo],
            PassKind::Overlay => vec![],
        }
    }

    pub fn outputs(&self) -> Vec<Target> {
        match self {
            PassKind::GBuffer => vec![
                Target::AgentInfo,
                Target::Normal,
                Target::Position,
                Target::GBufferDepth,
            ],
            PassKind::Ssao(o) => vec![raw_ao(*o)],
            PassKind::Blur(_, BlurAxis::Horizontal) => vec![Target::BlurIntermediate],
            PassKind::Blur(o, BlurAxis::Vertical) => vec![blurred_ao(*o)],
            PassKind::ClearOcclusion => vec![Target::Ssao1Blurred, Target::Ssao2Blurred],
            PassKind::Composite => vec![Target::BlurIntermediate],
            PassKind::Contour => vec![Target::Output, Target::OverlayDepth],
            PassKind::Overlay => vec![Target::Output, Target::OverlayDepth],
        }
    }
}

fn raw_ao(o: Occlusion) -> Target {
    match o {
        Occlusion::Near => Target::Ssao1,
        Occlusion::Far => Target::Ssao2,
    }
}

fn blurred_ao(o: Occlusion) -> Target {
    match o {
        Occlusion::Near => Target::Ssao1Blurred,
        Occlusion::Far => Target::Ssao2Blurred,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassPlan {
    passes: Vec<PassKind>,
}

impl PassPlan {
    pub fn new(passes: Vec<PassKind>) -> Self {
        Self { passes }
    }

    /// The pass sequence for a render style.
    pub fn for_style(style: RenderStyle) -> Self {
        use BlurAxis::*;
        use Occlusion::*;
        let passes = match style {
            RenderStyle::Instanced => vec![
                PassKind::GBuffer,
                PassKind::Ssao(Near),
                PassKind::Blur(Near, Horizontal),
                PassKind::Blur(Near, Vertical),
                PassKind::Ssao(Far),
                PassKind::Blur(Far, Horizontal),
                PassKind::Blur(Far, Vertical),
                PassKind::Composite,
                PassKind::Contour,
                PassKind::Overlay,
            ],
            RenderStyle::Generic => vec![
                PassKind::GBuffer,
                PassKind::ClearOcclusion,
                PassKind::Composite,
                PassKind::Contour,
                PassKind::Overlay,
            ],
        };
        Self { passes }
    }

    pub fn passes(&self) -> &[PassKind] {
        &self.passes
    }

    /// Check the read/write rules, returning the first violation.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let mut written: Vec<Target> = Vec::new();
        for pass in &self.passes {
            let outputs = pass.outputs();
            for input in pass.inputs() {
                if outputs.contains(&input) {
                    return Err(PipelineError::ReadWriteHazard {
                        pass: pass.name(),
                        target: input,
                    });
                }
                if !written.contains(&input) {
                    return Err(PipelineError::ReadBeforeWrite {
                        pass: pass.name(),
                        target: input,
                    });
                }
            }
            written.extend(outputs);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_plans_are_valid() {
        assert_eq!(PassPlan::for_style(RenderStyle::Instanced).validate(), Ok(()));
        assert_eq!(PassPlan::for_style(RenderStyle::Generic).validate(), Ok(()));
    }

    #[test]
    fn test_no_pass_reads_its_own_output() {
        for style in [RenderStyle::Instanced, RenderStyle::Generic] {
            for pass in PassPlan::for_style(style).passes() {
                let outputs = pass.outputs();
                assert!(pass.inputs().iter().all(|i| !outputs.contains(i)), "{}", pass.name());
            }
        }
    }

    #[test]
    fn test_composite_before_occlusion_is_rejected() {
        let plan = PassPlan::new(vec![PassKind::GBuffer, PassKind::Composite]);
        assert_eq!(
            plan.validate(),
            Err(PipelineError::ReadBeforeWrite {
                pass: "composite",
                target: Target::Ssao1Blurred,
            })
        );
    }

    #[test]
    fn test_contour_without_gbuffer_is_rejected() {
        let plan = PassPlan::new(vec![PassKind::Contour]);
        assert!(matches!(plan.validate(), Err(PipelineError::ReadBeforeWrite { .. })));
    }

    #[test]
    fn test_blur_intermediate_is_reused_sequentially() {
        let plan = PassPlan::for_style(RenderStyle::Instanced);
        let writers: Vec<&str> = plan
            .passes()
            .iter()
            .filter(|p| p.outputs().contains(&Target::BlurIntermediate))
            .map(|p| p.name())
            .collect();
        assert_eq!(writers, vec!["blur1_h", "blur2_h", "composite"]);
    }
}
