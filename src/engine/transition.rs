use std::collections::HashMap;

use uuid::Uuid;

use super::instance::InstanceHandle;
use super::place::Place;
use crate::error::{EngineError, WorkplanError};
use crate::workplan::{NodeId, Step, StepKind, Token};

/// What a successful firing asks the instance to do next.
#[derive(Debug)]
pub(crate) enum Firing {
    /// Split and join: output tokens are ready, keyed by output position.
    Produced {
        consumed: Vec<Uuid>,
        produced: Vec<(usize, Token)>,
    },
    /// Run the activity for the consumed token.
    Activity(Token),
    /// Hand the consumed token to a nested instance.
    Nested(Token),
}

/// Step instantiated inside one workplan instance.
pub(crate) struct Transition {
    pub step: Step,
    /// Place indices, in the step's input order.
    pub inputs: Vec<usize>,
    /// Place indices, in the step's output order.
    pub outputs: Vec<usize>,
    pub executing: bool,
    /// Token held while a task activity runs.
    pub in_flight: Option<Token>,
    pub child: Option<InstanceHandle>,
    pub fired: u64,
    /// Last payload reported by the activity.
    pub internal_state: serde_json::Value,
}

impl Transition {
    pub fn new(step: &Step, places: &HashMap<NodeId, usize>) -> Result<Self, WorkplanError> {
        let resolve = |ids: &[NodeId]| {
            ids.iter()
                .map(|id| {
                    places
                        .get(id)
                        .copied()
                        .ok_or(WorkplanError::UnknownConnector(*id))
                })
                .collect::<Result<Vec<_>, _>>()
        };
        Ok(Self {
            step: step.clone(),
            inputs: resolve(&step.inputs)?,
            outputs: resolve(&step.outputs)?,
            executing: false,
            in_flight: None,
            child: None,
            fired: 0,
            internal_state: serde_json::Value::Null,
        })
    }

    pub fn name(&self) -> &str {
        &self.step.name
    }

    fn ready(&self, places: &[Place]) -> bool {
        self.inputs.iter().all(|&p| places[p].can_forward())
    }

    /// Fire if every input holds a token.
    ///
    /// Returns `Ok(None)` when an input is empty. A transition still busy
    /// with a previous firing rejects with `ConcurrencyViolation` and leaves
    /// the tokens where they are.
    pub fn try_fire(&mut self, places: &mut [Place]) -> Result<Option<Firing>, EngineError> {
        if !self.ready(places) {
            return Ok(None);
        }
        if self.executing {
            return Err(EngineError::ConcurrencyViolation(self.step.name.clone()));
        }

        let mut consumed = Vec::with_capacity(self.inputs.len());
        for (position, &input) in self.inputs.iter().enumerate() {
            match places[input].take() {
                Some(token) => consumed.push(token),
                None => {
                    // The same place is listed twice and ran dry.
                    for (token, &place) in consumed.into_iter().zip(&self.inputs[..position]).rev() {
                        places[place].push_front(token);
                    }
                    return Ok(None);
                }
            }
        }
        self.fired += 1;

        let firing = match &self.step.kind {
            StepKind::Split => {
                let token = consumed.remove(0);
                let origin = token.id;
                Firing::Produced {
                    consumed: vec![origin],
                    produced: token.split(self.outputs.len()).into_iter().enumerate().collect(),
                }
            }
            StepKind::Join => Firing::Produced {
                consumed: consumed.iter().map(|t| t.id).collect(),
                produced: vec![(0, Token::join(consumed))],
            },
            StepKind::Task { .. } => {
                self.executing = true;
                Firing::Activity(consumed.remove(0))
            }
            StepKind::Subworkplan { .. } => {
                self.executing = true;
                Firing::Nested(consumed.remove(0))
            }
        };
        Ok(Some(firing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workplan::{Connector, NodeClassification, TokenKind};

    fn places(count: u32) -> (Vec<Place>, HashMap<NodeId, usize>) {
        let places: Vec<Place> = (1..=count)
            .map(|id| {
                Place::new(
                    &Connector {
                        id,
                        name: format!("C{id}"),
                        classification: NodeClassification::Intermediate,
                    },
                    None,
                )
            })
            .collect();
        let index = places
            .iter()
            .enumerate()
            .map(|(i, p)| (p.connector, i))
            .collect();
        (places, index)
    }

    #[test]
    fn join_waits_for_every_input() {
        let (mut places, index) = places(3);
        let step = Step::join("Merge").inputs([1, 2]).output(3);
        let mut join = Transition::new(&step, &index).unwrap();

        let t1_token = Token::new("T1");
        let t1 = t1_token.id;
        places[0].push(t1_token);
        assert!(join.try_fire(&mut places).unwrap().is_none());
        assert_eq!(join.fired, 0);

        places[1].push(Token::new("T2"));
        match join.try_fire(&mut places).unwrap() {
            Some(Firing::Produced { consumed, produced }) => {
                assert_eq!(consumed.len(), 2);
                assert_eq!(consumed[0], t1);
                assert_eq!(produced.len(), 1);
                assert_eq!(produced[0].1.name, "T1");
                assert!(matches!(&produced[0].1.kind, TokenKind::Joined { parts } if parts.len() == 2));
            }
            other => panic!("unexpected firing {other:?}"),
        }
        assert!(places[0].is_empty());
        assert!(places[1].is_empty());
        assert_eq!(join.fired, 1);
        assert!(join.try_fire(&mut places).unwrap().is_none());
    }

    #[test]
    fn split_produces_one_token_per_output() {
        let (mut places, index) = places(4);
        let step = Step::split("Fork").input(1).outputs([2, 3, 4]);
        let mut split = Transition::new(&step, &index).unwrap();

        places[0].push(Token::new("board"));
        let Some(Firing::Produced { consumed, produced }) = split.try_fire(&mut places).unwrap()
        else {
            panic!("split did not fire");
        };
        assert_eq!(consumed.len(), 1);
        let positions: Vec<usize> = produced.iter().map(|(p, _)| *p).collect();
        assert_eq!(positions, [0, 1, 2]);
        assert!(!split.executing);
    }

    #[test]
    fn busy_task_leaves_token_queued() {
        let (mut places, index) = places(3);
        let step = Step::task("Mount", "mount").input(1).outputs([2, 3]);
        let mut task = Transition::new(&step, &index).unwrap();

        places[0].push(Token::new("a"));
        places[0].push(Token::new("b"));
        assert!(matches!(task.try_fire(&mut places), Ok(Some(Firing::Activity(t))) if t.name == "a"));
        assert!(task.executing);
        assert_eq!(
            task.try_fire(&mut places).unwrap_err(),
            EngineError::ConcurrencyViolation("Mount".into())
        );
        assert_eq!(places[0].tokens().count(), 1);
    }

    #[test]
    fn unknown_connector_is_reported() {
        let (_, index) = places(1);
        let step = Step::task("Mount", "mount").input(1).outputs([8, 9]);
        assert_eq!(
            Transition::new(&step, &index).err(),
            Some(WorkplanError::UnknownConnector(8))
        );
    }
}
