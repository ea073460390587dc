//! Integer expression evaluator with an optional native-code JIT.
//!
//! Text is parsed into an arena-backed [`Ast`], which is either walked by
//! [`interpret`] or compiled by [`jit::compile`] into a small stack-machine
//! program in executable memory.

use std::fmt;

pub mod jit;
pub mod params;
pub mod parser;
pub mod pool;

pub use jit::{CompiledProgram, JitError};
pub use params::Config;
pub use parser::{parse, ParseError};

pub type NumT = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatorKind {
    Add,
    Sub,
    Mul,
    Div,
    Xor,
}

impl OperatorKind {
    pub const ALL: [OperatorKind; 5] = [
        OperatorKind::Add,
        OperatorKind::Sub,
        OperatorKind::Mul,
        OperatorKind::Div,
        OperatorKind::Xor,
    ];

    /// Binding strength, higher binds tighter.
    pub fn precedence(self) -> u8 {
        match self {
            OperatorKind::Xor => 1,
            OperatorKind::Add | OperatorKind::Sub => 2,
            OperatorKind::Mul | OperatorKind::Div => 3,
        }
    }

    pub fn is_right_assoc(self) -> bool {
        false
    }

    /// Whether the emitted sequence for this operator leaves a byproduct in
    /// the register the JIT uses to index the constant pool.
    ///
    /// Only the widening multiply does: its high half lands in the index
    /// register on every supported target.
    pub fn clobbers_index(self) -> bool {
        matches!(self, OperatorKind::Mul)
    }

    pub fn symbol(self) -> char {
        match self {
            OperatorKind::Add => '+',
            OperatorKind::Sub => '-',
            OperatorKind::Mul => '*',
            OperatorKind::Div => '/',
            OperatorKind::Xor => '^',
        }
    }

    /// Applies the operator with the crate's integer semantics.
    pub fn apply(self, l: NumT, r: NumT) -> Result<NumT, EvaluationError> {
        Ok(match self {
            OperatorKind::Add => l.wrapping_add(r),
            OperatorKind::Sub => l.wrapping_sub(r),
            OperatorKind::Mul => l.wrapping_mul(r),
            OperatorKind::Xor => l ^ r,
            OperatorKind::Div => {
                if r == 0 {
                    return Err(EvaluationError::DivisionByZero);
                }
                // i64::MIN / -1 wraps instead of trapping
                l.wrapping_div(r)
            }
        })
    }
}

impl fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// Handle to a node inside an [`Ast`] arena.
///
/// Deliberately neither `Copy` nor `Clone`: [`AstBuilder::binary`] consumes
/// the ids of its children, so every node ends up with exactly one parent.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Node {
    Leaf(NumT),
    Binary {
        op: OperatorKind,
        left: NodeId,
        right: NodeId,
    },
}

#[derive(Debug, Default)]
pub struct AstBuilder {
    nodes: Vec<Node>,
}

impl AstBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn leaf(&mut self, value: NumT) -> NodeId {
        self.push(Node::Leaf(value))
    }

    pub fn binary(&mut self, op: OperatorKind, left: NodeId, right: NodeId) -> NodeId {
        debug_assert!(left.index() < self.nodes.len() && right.index() < self.nodes.len());
        self.push(Node::Binary { op, left, right })
    }

    pub fn finish(self, root: NodeId) -> Ast {
        debug_assert!(root.index() < self.nodes.len());
        Ast { nodes: self.nodes, root }
    }

    fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }
}

/// A parsed expression. Nodes live in one arena owned by the tree; children
/// always precede their parent in the arena.
#[derive(Debug)]
pub struct Ast {
    nodes: Vec<Node>,
    root: NodeId,
}

impl Ast {
    pub fn root(&self) -> &NodeId {
        &self.root
    }

    pub fn node(&self, id: &NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    /// Left subtree, right subtree, then the node itself.
    pub fn post_order(&self) -> PostOrder<'_> {
        PostOrder {
            ast: self,
            stack: vec![(self.root.index(), false)],
        }
    }
}

impl PartialEq for Ast {
    fn eq(&self, other: &Self) -> bool {
        // Binary arity makes the post-order sequence determine the shape.
        fn shape(n: &Node) -> (Option<OperatorKind>, NumT) {
            match n {
                Node::Leaf(v) => (None, *v),
                Node::Binary { op, .. } => (Some(*op), 0),
            }
        }
        self.post_order().map(shape).eq(other.post_order().map(shape))
    }
}

impl Eq for Ast {}

pub struct PostOrder<'a> {
    ast: &'a Ast,
    stack: Vec<(usize, bool)>,
}

impl<'a> Iterator for PostOrder<'a> {
    type Item = &'a Node;

    fn next(&mut self) -> Option<&'a Node> {
        loop {
            let (idx, expanded) = self.stack.pop()?;
            let node = &self.ast.nodes[idx];
            match node {
                Node::Binary { left, right, .. } if !expanded => {
                    self.stack.push((idx, true));
                    self.stack.push((right.index(), false));
                    self.stack.push((left.index(), false));
                }
                _ => return Some(node),
            }
        }
    }
}

/// Leaf and operator counts of a tree, the input to JIT sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TreeShape {
    pub leaf_count: usize,
    pub operator_count: usize,
    /// Most operands pending at once when the tree is evaluated in post-order.
    pub max_stack_depth: usize,
}

pub fn analyze(ast: &Ast) -> TreeShape {
    let mut shape = TreeShape::default();
    let mut depth = 0usize;
    for node in ast.post_order() {
        match node {
            Node::Leaf(_) => {
                shape.leaf_count += 1;
                depth += 1;
                shape.max_stack_depth = shape.max_stack_depth.max(depth);
            }
            // pops two, pushes one
            Node::Binary { .. } => {
                shape.operator_count += 1;
                depth -= 1;
            }
        }
    }
    shape
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EvaluationError {
    #[error("division by zero")]
    DivisionByZero,
}

/// Reference evaluator. Values are kept per arena slot, so no recursion is
/// needed regardless of tree depth.
pub fn interpret(ast: &Ast) -> Result<NumT, EvaluationError> {
    let mut values: Vec<NumT> = vec![0; ast.nodes.len()];
    let mut stack = vec![(ast.root.index(), false)];

    while let Some((idx, expanded)) = stack.pop() {
        match &ast.nodes[idx] {
            Node::Leaf(v) => values[idx] = *v,
            Node::Binary { left, right, .. } if !expanded => {
                stack.push((idx, true));
                stack.push((right.index(), false));
                stack.push((left.index(), false));
            }
            Node::Binary { op, left, right } => {
                values[idx] = op.apply(values[left.index()], values[right.index()])?;
            }
        }
    }
    Ok(values[ast.root.index()])
}

/// Check if a child needs parentheses under `parent`.
fn needs_parens(child: OperatorKind, parent: OperatorKind, is_right: bool) -> bool {
    let (c, p) = (child.precedence(), parent.precedence());
    // Left-associative: a same-precedence right child must stay grouped.
    c < p || (is_right && c == p && !parent.is_right_assoc())
}

impl fmt::Display for Ast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        enum Step<'a> {
            Visit(&'a NodeId, Option<(OperatorKind, bool)>),
            Text(&'static str),
            Op(OperatorKind),
        }

        let mut steps = vec![Step::Visit(&self.root, None)];
        while let Some(step) = steps.pop() {
            match step {
                Step::Text(s) => f.write_str(s)?,
                Step::Op(op) => write!(f, "{op}")?,
                Step::Visit(id, parent) => match self.node(id) {
                    Node::Leaf(v) => write!(f, "{v}")?,
                    Node::Binary { op, left, right } => {
                        let wrap = parent.is_some_and(|(p, is_right)| needs_parens(*op, p, is_right));
                        if wrap {
                            f.write_str("(")?;
                            steps.push(Step::Text(")"));
                        }
                        steps.push(Step::Visit(right, Some((*op, true))));
                        steps.push(Step::Op(*op));
                        steps.push(Step::Visit(left, Some((*op, false))));
                    }
                },
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),
    #[error("jit error: {0}")]
    Jit(#[from] JitError),
}

/// Parse and evaluate one expression with the session configuration.
///
/// In JIT mode every call builds and tears down its own engine instance.
pub fn evaluate(src: &str, config: &Config) -> Result<NumT, Error> {
    let ast = parse(src)?;
    evaluate_ast(&ast, config)
}

/// Evaluate an already parsed tree, for callers that also need the AST.
pub fn evaluate_ast(ast: &Ast, config: &Config) -> Result<NumT, Error> {
    if config.jit {
        let program = jit::compile(ast)?;
        Ok(program.run()?)
    } else {
        Ok(interpret(ast)?)
    }
}
