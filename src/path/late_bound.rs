use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::rc::Rc;

use super::{is_absolute, normalize};
use crate::error::{TraceResult, TracingFailure};
use trace_results::Pid;

/// Initial working directories bound after the fact, keyed by pid.
pub type Anchors = HashMap<Pid, LateBoundPath>;

enum Node {
    Absolute(String),
    Relative {
        parent: LateBoundPath,
        fragment: String,
    },
    /// The cwd a process inherited from its parent, only known once the parent's fork has been
    /// replayed.
    InitialCwdOf(Pid),
}

/// The value of a working directory at one point of the trace.
///
/// Nodes are immutable: changing directory creates a new node chained to the previous one, so
/// the references already captured by children keep pointing at the value they inherited.
#[derive(Clone)]
pub struct LateBoundPath(Rc<Node>);

impl LateBoundPath {
    pub fn absolute<S: Into<String>>(path: S) -> Self {
        Self(Rc::new(Node::Absolute(path.into())))
    }

    pub fn initial_cwd_of(pid: Pid) -> Self {
        Self(Rc::new(Node::InitialCwdOf(pid)))
    }

    /// Resolves `fragment` against this node. An absolute fragment discards the chain.
    pub fn join<S: Into<String>>(&self, fragment: S) -> Self {
        let fragment = fragment.into();
        if is_absolute(&fragment) {
            Self::absolute(fragment)
        } else {
            Self(Rc::new(Node::Relative {
                parent: self.clone(),
                fragment,
            }))
        }
    }

    /// Identifies the path without walking the chain: the same parent node joined with the
    /// same fragment is the same path.
    pub fn key(&self) -> PathKey {
        match self.0.as_ref() {
            Node::Absolute(path) => PathKey::Absolute(path.clone()),
            Node::Relative { parent, fragment } => {
                PathKey::Relative(Rc::as_ptr(&parent.0) as usize, fragment.clone())
            }
            Node::InitialCwdOf(pid) => PathKey::InitialCwdOf(*pid),
        }
    }

    /// Walks to the nearest absolute ancestor and applies every fragment in order.
    pub fn render(&self, anchors: &Anchors) -> TraceResult<String> {
        let mut fragments = Vec::new();
        let mut hops = 0;
        let mut current = self;
        loop {
            match current.0.as_ref() {
                Node::Absolute(base) => {
                    fragments.reverse();
                    return Ok(normalize(base, &fragments));
                }
                Node::Relative { parent, fragment } => {
                    fragments.push(fragment.as_str());
                    current = parent;
                }
                Node::InitialCwdOf(pid) => {
                    current = anchors.get(pid).ok_or_else(|| {
                        TracingFailure::inconsistency(format!(
                            "Initial working directory of pid {pid} is unknown"
                        ))
                    })?;
                    // Visiting more anchors than there are means a cycle.
                    hops += 1;
                    if hops > anchors.len() {
                        return Err(TracingFailure::inconsistency(
                            "Working directory chain does not terminate",
                        ));
                    }
                }
            }
        }
    }
}

/// Only valid while the keyed path is alive, as it holds its parent node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathKey {
    Absolute(String),
    Relative(usize, String),
    InitialCwdOf(Pid),
}

impl Drop for Node {
    /// Unlinks the chain one node at a time, a recursive drop of a long chain would overflow
    /// the stack.
    fn drop(&mut self) {
        let Node::Relative { parent, .. } = self else {
            return;
        };
        let mut next = mem::replace(parent, LateBoundPath::initial_cwd_of(0));
        while let Ok(mut node) = Rc::try_unwrap(next.0) {
            let Node::Relative { parent, .. } = &mut node else {
                break;
            };
            next = mem::replace(parent, LateBoundPath::initial_cwd_of(0));
        }
    }
}

impl fmt::Debug for LateBoundPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LateBoundPath({self})")
    }
}

impl fmt::Display for LateBoundPath {
    /// Debug rendering only, the chain is not resolved.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut fragments = Vec::new();
        let mut current = self;
        loop {
            match current.0.as_ref() {
                Node::Absolute(path) => {
                    write!(f, "{path}")?;
                    break;
                }
                Node::Relative { parent, fragment } => {
                    fragments.push(fragment.as_str());
                    current = parent;
                }
                Node::InitialCwdOf(pid) => {
                    write!(f, "<cwd of {pid}>")?;
                    break;
                }
            }
        }
        for fragment in fragments.iter().rev() {
            write!(f, " + {fragment}")?;
        }
        Ok(())
    }
}
