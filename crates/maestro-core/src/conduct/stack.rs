//! Runtime frames and the resume token.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;

/// One runtime stack frame.
///
/// Wire shapes: a let-frame is `{"let": {...}}`, a mask-frame is
/// `{"let": null}`, a catch-frame is `{"catch": <fsm index>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Frame {
    Catch {
        catch: usize,
    },
    Let {
        #[serde(rename = "let")]
        vars: Option<Map<String, Value>>,
    },
}

impl Frame {
    /// A variable frame.
    pub fn let_frame(vars: Map<String, Value>) -> Self {
        Self::Let { vars: Some(vars) }
    }

    /// A mask frame, hiding one enclosing let-frame.
    pub fn mask() -> Self {
        Self::Let { vars: None }
    }

    /// A catch frame pointing at a handler state.
    pub fn catch(index: usize) -> Self {
        Self::Catch { catch: index }
    }

    pub fn is_catch(&self) -> bool {
        matches!(self, Self::Catch { .. })
    }
}

/// The serialized continuation a host passes back to re-enter a suspended
/// composition: the FSM index to resume at (absent when terminal) and the
/// runtime stack, most recent frame first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<usize>,
    pub stack: VecDeque<Frame>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_wire_shapes() {
        assert_eq!(
            serde_json::to_value(Frame::catch(7)).unwrap(),
            json!({"catch": 7})
        );
        assert_eq!(
            serde_json::to_value(Frame::mask()).unwrap(),
            json!({"let": null})
        );
        let mut vars = Map::new();
        vars.insert("x".to_string(), json!(1));
        assert_eq!(
            serde_json::to_value(Frame::let_frame(vars)).unwrap(),
            json!({"let": {"x": 1}})
        );
    }

    #[test]
    fn test_frame_deserialization_distinguishes_variants() {
        let frame: Frame = serde_json::from_value(json!({"catch": 3})).unwrap();
        assert_eq!(frame, Frame::catch(3));

        let frame: Frame = serde_json::from_value(json!({"let": null})).unwrap();
        assert_eq!(frame, Frame::mask());

        let frame: Frame = serde_json::from_value(json!({"let": {"n": 2}})).unwrap();
        assert!(matches!(frame, Frame::Let { vars: Some(vars) } if vars.get("n") == Some(&json!(2))));
    }

    #[test]
    fn test_resume_state_requires_a_stack() {
        let resume: Result<ResumeState, _> = serde_json::from_value(json!({"state": 4}));
        assert!(resume.is_err());

        let resume: ResumeState =
            serde_json::from_value(json!({"state": 4, "stack": [{"let": null}]})).unwrap();
        assert_eq!(resume.state, Some(4));
        assert_eq!(resume.stack.len(), 1);
    }
}
