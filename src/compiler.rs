//! AST to FSM lowering.
//!
//! One rule per combinator, each producing a flat list of states whose
//! jumps are relative offsets. Rules concatenate compiled children without
//! inspecting them, with one deliberate exception: every compiled sub-list
//! ends on a state with a default `next`, so an enclosing rule may retarget
//! its child's fall-through edge (`if` skipping the alternate, loops taking
//! the back edge).

use thiserror::Error;

use crate::ast::{AstKind, AstNode};
use crate::fsm::{Op, State};

/// Raised when a composition node is missing a required child.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("{kind:?} node at '{path}' is missing its '{child}' child")]
    MissingChild {
        kind: AstKind,
        child: &'static str,
        path: String,
    },
}

/// Compile a composition tree into a flat state list.
pub fn compile(node: &AstNode) -> Result<Vec<State>, CompileError> {
    let mut fsm = match node.kind {
        AstKind::Empty => vec![own(node, Op::Empty)],
        AstKind::Sequence => {
            let mut fsm = vec![own(node, Op::Pass)];
            for component in node.components.as_deref().unwrap_or_default() {
                fsm.extend(compile(component)?);
            }
            fsm
        }
        AstKind::Action => {
            let mut head = own(node, Op::Action);
            head.name = Some(required_name(node)?.to_owned());
            vec![head]
        }
        AstKind::Function => {
            let mut head = own(node, Op::Function);
            head.exec = Some(
                node.exec
                    .clone()
                    .ok_or_else(|| missing(node, "exec"))?,
            );
            vec![head]
        }
        AstKind::Dynamic => vec![own(node, Op::Dynamic)],
        AstKind::Async => {
            let body = compile_body(node)?;
            let mut head = own(node, Op::Async);
            head.resume = Some(body.len() as i64 + 2);
            let mut fsm = vec![head];
            fsm.extend(body);
            fsm.push(own(node, Op::Stop));
            fsm.push(own(node, Op::Pass));
            fsm
        }
        AstKind::Map => {
            let body = compile_body(node)?;
            let mut head = own(node, Op::Map);
            head.resume = Some(body.len() as i64 + 2);
            let mut fsm = vec![head];
            fsm.extend(body);
            fsm.push(own(node, Op::Stop));
            fsm.push(own(node, Op::Pass));
            fsm
        }
        AstKind::Let => {
            let declarations = node
                .declarations
                .clone()
                .ok_or_else(|| missing(node, "declarations"))?;
            let body = compile_body(node)?;
            let mut head = own(node, Op::Let);
            head.bindings = Some(Some(declarations));
            let mut fsm = vec![head];
            fsm.extend(body);
            fsm.push(own(node, Op::Exit));
            fsm
        }
        AstKind::Mask => {
            let body = compile_body(node)?;
            let mut head = own(node, Op::Let);
            head.bindings = Some(None);
            let mut fsm = vec![head];
            fsm.extend(body);
            fsm.push(own(node, Op::Exit));
            fsm
        }
        AstKind::Finally => {
            let body = compile(required(node, node.body.as_deref(), "body")?)?;
            let finalizer = compile(required(node, node.finalizer.as_deref(), "finalizer")?)?;
            let mut head = own(node, Op::Try);
            head.handler = Some(body.len() as i64 + 2);
            let mut fsm = vec![head];
            fsm.extend(body);
            fsm.push(own(node, Op::Exit));
            fsm.extend(finalizer);
            fsm
        }
        AstKind::Try => {
            let body = compile(required(node, node.body.as_deref(), "body")?)?;
            let handler = compile(required(node, node.handler.as_deref(), "handler")?)?;
            let mut head = own(node, Op::Try);
            head.handler = Some(body.len() as i64 + 2);
            let mut exit = own(node, Op::Exit);
            exit.next = Some(handler.len() as i64 + 1);
            let mut fsm = vec![head];
            fsm.extend(body);
            fsm.push(exit);
            fsm.extend(handler);
            fsm.push(own(node, Op::Pass));
            fsm
        }
        AstKind::IfNosave => {
            let test = compile(required(node, node.test.as_deref(), "test")?)?;
            let mut consequent = compile(required(node, node.consequent.as_deref(), "consequent")?)?;
            let alternate = compile_optional(node, node.alternate.as_deref())?;
            set_tail_next(&mut consequent, alternate.len() as i64 + 1);
            let mut choice = own(node, Op::Choice);
            choice.then = Some(1);
            choice.alt = Some(consequent.len() as i64 + 1);
            let mut fsm = vec![own(node, Op::Pass)];
            fsm.extend(test);
            fsm.push(choice);
            fsm.extend(consequent);
            fsm.extend(alternate);
            fsm.push(own(node, Op::Pass));
            fsm
        }
        AstKind::WhileNosave => {
            let test = compile(required(node, node.test.as_deref(), "test")?)?;
            let mut body = compile(required(node, node.body.as_deref(), "body")?)?;
            let offset = -((test.len() + body.len()) as i64);
            set_tail_next(&mut body, offset);
            let mut choice = own(node, Op::Choice);
            choice.then = Some(1);
            choice.alt = Some(body.len() as i64 + 1);
            let mut fsm = vec![own(node, Op::Pass)];
            fsm.extend(test);
            fsm.push(choice);
            fsm.extend(body);
            fsm.push(own(node, Op::Pass));
            fsm
        }
        AstKind::DowhileNosave => {
            let body = compile(required(node, node.body.as_deref(), "body")?)?;
            let test = compile(required(node, node.test.as_deref(), "test")?)?;
            let mut choice = own(node, Op::Choice);
            choice.then = Some(-((body.len() + test.len()) as i64));
            choice.alt = Some(1);
            let mut fsm = vec![own(node, Op::Pass)];
            fsm.extend(body);
            fsm.extend(test);
            fsm.push(choice);
            fsm.push(own(node, Op::Pass));
            fsm
        }
        AstKind::Parallel => {
            let components = node
                .components
                .as_deref()
                .ok_or_else(|| missing(node, "components"))?;
            let mut tasks = Vec::with_capacity(components.len());
            let mut branches = Vec::new();
            for component in components {
                tasks.push(branches.len() as i64 + 1);
                branches.extend(compile(component)?);
                branches.push(own(node, Op::Stop));
            }
            let mut head = own(node, Op::Parallel);
            head.resume = Some(branches.len() as i64 + 1);
            head.tasks = Some(tasks);
            let mut fsm = vec![head];
            fsm.extend(branches);
            fsm.push(own(node, Op::Pass));
            fsm
        }
    };
    if fsm[0].path.is_none() {
        fsm[0].path = node.path.clone();
    }
    Ok(fsm)
}

/// States created by the rule for `node` itself carry its path as `parent`.
fn own(node: &AstNode, op: Op) -> State {
    let mut state = State::new(op);
    state.parent = node.path.clone();
    state
}

fn missing(node: &AstNode, child: &'static str) -> CompileError {
    CompileError::MissingChild {
        kind: node.kind,
        child,
        path: node.path_or_empty().to_owned(),
    }
}

fn required<'a>(
    node: &AstNode,
    child: Option<&'a AstNode>,
    name: &'static str,
) -> Result<&'a AstNode, CompileError> {
    child.ok_or_else(|| missing(node, name))
}

fn required_name(node: &AstNode) -> Result<&str, CompileError> {
    node.name.as_deref().ok_or_else(|| missing(node, "name"))
}

/// Body of `async`/`map`/`let`/`mask`: a single `body` node or an inline
/// component list; absent bodies compile to a single `empty` state.
fn compile_body(node: &AstNode) -> Result<Vec<State>, CompileError> {
    if let Some(body) = node.body.as_deref() {
        return compile(body);
    }
    match node.components.as_deref() {
        Some(components) if !components.is_empty() => {
            let mut states = Vec::new();
            for component in components {
                states.extend(compile(component)?);
            }
            Ok(states)
        }
        _ => Ok(vec![own(node, Op::Empty)]),
    }
}

fn compile_optional(node: &AstNode, child: Option<&AstNode>) -> Result<Vec<State>, CompileError> {
    match child {
        Some(child) => compile(child),
        None => Ok(vec![own(node, Op::Empty)]),
    }
}

/// Retarget a compiled sub-list's fall-through edge. Sub-lists always end
/// on a default-`next` state, which is what makes this sound.
fn set_tail_next(states: &mut [State], next: i64) {
    if let Some(tail) = states.last_mut() {
        tail.next = Some(next);
    }
}
