use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a token came into existence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TokenKind {
    /// Injected into the start place.
    Main,
    /// Produced by a split; `origin` is the consumed token.
    Split { origin: Uuid, branch: usize },
    /// Produced by a join. Owns every consumed token, primary input first.
    Joined { parts: Vec<Token> },
}

/// Unit of flow. Moved between holders, never duplicated while live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub kind: TokenKind,
}

impl Token {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_kind(name, TokenKind::Main)
    }

    fn with_kind(name: impl Into<String>, kind: TokenKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            created_at: Utc::now(),
            kind,
        }
    }

    /// Fan `self` out into one token per branch.
    pub fn split(self, branches: usize) -> Vec<Token> {
        (0..branches)
            .map(|branch| {
                Token::with_kind(
                    format!("{}.{branch}", self.name),
                    TokenKind::Split {
                        origin: self.id,
                        branch,
                    },
                )
            })
            .collect()
    }

    /// Merge tokens consumed by a join. The first part is the primary input
    /// and lends its name to the result.
    pub fn join(parts: Vec<Token>) -> Token {
        let name = parts
            .first()
            .map(|primary| primary.name.clone())
            .unwrap_or_default();
        Token::with_kind(name, TokenKind::Joined { parts })
    }

    /// Number of original tokens folded into this one.
    pub fn weight(&self) -> usize {
        match &self.kind {
            TokenKind::Joined { parts } => parts.iter().map(Token::weight).sum(),
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_children_reference_origin() {
        let token = Token::new("pcb-17");
        let origin = token.id;
        let children = token.split(3);
        assert_eq!(children.len(), 3);
        for (branch, child) in children.iter().enumerate() {
            assert_eq!(child.kind, TokenKind::Split { origin, branch });
            assert_ne!(child.id, origin);
        }
        assert_eq!(children[2].name, "pcb-17.2");
    }

    #[test]
    fn join_takes_primary_name_and_owns_parts() {
        let primary = Token::new("housing");
        let secondary = Token::new("lid");
        let primary_id = primary.id;
        let joined = Token::join(vec![primary, secondary]);

        assert_eq!(joined.name, "housing");
        assert_ne!(joined.id, primary_id);
        match &joined.kind {
            TokenKind::Joined { parts } => {
                assert_eq!(parts.len(), 2);
                assert_eq!(parts[0].id, primary_id);
            }
            other => panic!("unexpected kind {other:?}"),
        }
        assert_eq!(joined.weight(), 2);
    }
}
