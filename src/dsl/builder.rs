//! Typed wrappers and the statement-tree builder.
//!
//! `IntExpr`/`FloatExpr` are value handles carrying an AST fragment;
//! `IntVar`/`FloatVar`/`Ptr` are assignable slots. Control flow is built
//! with closures on the builder (`if_`, `while_`, `where_`), which push and
//! pop statement blocks.

use std::marker::PhantomData;

use crate::core::{AluOp, CmpOp};

use super::ast::{BCond, Cmp, Expr, Kernel, ParamKind, RotAmount, SfuFunc, Stmt, VarId};

/// Marker for integer array elements.
#[derive(Debug, Clone, Copy)]
pub struct IntElem;

/// Marker for float array elements.
#[derive(Debug, Clone, Copy)]
pub struct FloatElem;

/// An integer vector expression.
#[derive(Debug, Clone)]
pub struct IntExpr(pub(crate) Expr);

/// A float vector expression.
#[derive(Debug, Clone)]
pub struct FloatExpr(pub(crate) Expr);

/// An assignable integer variable.
#[derive(Debug, Clone, Copy)]
pub struct IntVar(pub(crate) VarId);

/// An assignable float variable.
#[derive(Debug, Clone, Copy)]
pub struct FloatVar(pub(crate) VarId);

/// A pointer into a shared array of `E`.
#[derive(Debug, Clone, Copy)]
pub struct Ptr<E> {
    pub(crate) var: VarId,
    _elem: PhantomData<E>,
}

/// A complex value: a pair of float expressions.
#[derive(Debug, Clone)]
pub struct Complex {
    pub re: FloatExpr,
    pub im: FloatExpr,
}

impl From<IntVar> for IntExpr {
    fn from(v: IntVar) -> IntExpr {
        IntExpr(Expr::Var(v.0))
    }
}

impl From<FloatVar> for FloatExpr {
    fn from(v: FloatVar) -> FloatExpr {
        FloatExpr(Expr::Var(v.0))
    }
}

impl From<i32> for IntExpr {
    fn from(v: i32) -> IntExpr {
        IntExpr(Expr::IntLit(v))
    }
}

impl From<f32> for FloatExpr {
    fn from(v: f32) -> FloatExpr {
        FloatExpr(Expr::FloatLit(v))
    }
}

fn int_binop(op: AluOp, lhs: IntExpr, rhs: impl Into<IntExpr>) -> IntExpr {
    IntExpr(Expr::BinOp {
        op,
        lhs: Box::new(lhs.0),
        rhs: Box::new(rhs.into().0),
    })
}

fn float_binop(op: AluOp, lhs: FloatExpr, rhs: impl Into<FloatExpr>) -> FloatExpr {
    FloatExpr(Expr::BinOp {
        op,
        lhs: Box::new(lhs.0),
        rhs: Box::new(rhs.into().0),
    })
}

macro_rules! int_op {
    ($trait:ident, $method:ident, $op:expr) => {
        impl<R: Into<IntExpr>> std::ops::$trait<R> for IntExpr {
            type Output = IntExpr;
            fn $method(self, rhs: R) -> IntExpr {
                int_binop($op, self, rhs)
            }
        }
        impl<R: Into<IntExpr>> std::ops::$trait<R> for IntVar {
            type Output = IntExpr;
            fn $method(self, rhs: R) -> IntExpr {
                int_binop($op, self.into(), rhs)
            }
        }
    };
}

int_op!(Add, add, AluOp::Add);
int_op!(Sub, sub, AluOp::Sub);
int_op!(BitAnd, bitand, AluOp::BAnd);
int_op!(BitOr, bitor, AluOp::BOr);
int_op!(BitXor, bitxor, AluOp::BXor);
int_op!(Shl, shl, AluOp::Shl);
int_op!(Shr, shr, AluOp::Shr);

impl<R: Into<IntExpr>> std::ops::Mul<R> for IntExpr {
    type Output = IntExpr;
    fn mul(self, rhs: R) -> IntExpr {
        int_binop(AluOp::Mul24, self, rhs)
    }
}

impl<R: Into<IntExpr>> std::ops::Mul<R> for IntVar {
    type Output = IntExpr;
    fn mul(self, rhs: R) -> IntExpr {
        int_binop(AluOp::Mul24, IntExpr::from(self), rhs)
    }
}

macro_rules! float_op {
    ($trait:ident, $method:ident, $op:expr) => {
        impl<R: Into<FloatExpr>> std::ops::$trait<R> for FloatExpr {
            type Output = FloatExpr;
            fn $method(self, rhs: R) -> FloatExpr {
                float_binop($op, self, rhs)
            }
        }
        impl<R: Into<FloatExpr>> std::ops::$trait<R> for FloatVar {
            type Output = FloatExpr;
            fn $method(self, rhs: R) -> FloatExpr {
                float_binop($op, self.into(), rhs)
            }
        }
    };
}

float_op!(Add, add, AluOp::FAdd);
float_op!(Sub, sub, AluOp::FSub);
float_op!(Mul, mul, AluOp::FMul);

impl IntExpr {
    pub fn min(self, rhs: impl Into<IntExpr>) -> IntExpr {
        int_binop(AluOp::Min, self, rhs)
    }

    pub fn max(self, rhs: impl Into<IntExpr>) -> IntExpr {
        int_binop(AluOp::Max, self, rhs)
    }

    pub fn asr(self, n: i32) -> IntExpr {
        int_binop(AluOp::Asr, self, IntExpr::from(n))
    }

    pub fn to_float(self) -> FloatExpr {
        FloatExpr(Expr::BinOp {
            op: AluOp::ItoF,
            lhs: Box::new(self.0.clone()),
            rhs: Box::new(self.0),
        })
    }

    /// Rotate the vector's lanes by a compile-time distance.
    pub fn rotate(self, n: i32) -> IntExpr {
        IntExpr(Expr::Rotate {
            src: Box::new(self.0),
            amount: RotAmount::Imm(n),
        })
    }

    /// Rotate by the value in lane 0 of `amount`.
    pub fn rotate_by(self, amount: IntExpr) -> IntExpr {
        IntExpr(Expr::Rotate {
            src: Box::new(self.0),
            amount: RotAmount::Expr(Box::new(amount.0)),
        })
    }
}

impl FloatExpr {
    pub fn fmin(self, rhs: impl Into<FloatExpr>) -> FloatExpr {
        float_binop(AluOp::FMin, self, rhs)
    }

    pub fn fmax(self, rhs: impl Into<FloatExpr>) -> FloatExpr {
        float_binop(AluOp::FMax, self, rhs)
    }

    pub fn to_int(self) -> IntExpr {
        IntExpr(Expr::BinOp {
            op: AluOp::FtoI,
            lhs: Box::new(self.0.clone()),
            rhs: Box::new(self.0),
        })
    }

    fn sfu(self, f: SfuFunc) -> FloatExpr {
        FloatExpr(Expr::Sfu { f, arg: Box::new(self.0) })
    }

    pub fn recip(self) -> FloatExpr {
        self.sfu(SfuFunc::Recip)
    }

    pub fn recip_sqrt(self) -> FloatExpr {
        self.sfu(SfuFunc::RecipSqrt)
    }

    pub fn exp2(self) -> FloatExpr {
        self.sfu(SfuFunc::Exp)
    }

    pub fn log2(self) -> FloatExpr {
        self.sfu(SfuFunc::Log)
    }
}

impl Complex {
    pub fn new(re: FloatExpr, im: FloatExpr) -> Complex {
        Complex { re, im }
    }

    /// Squared magnitude.
    pub fn mag_square(&self) -> FloatExpr {
        self.re.clone() * self.re.clone() + self.im.clone() * self.im.clone()
    }
}

impl std::ops::Add for Complex {
    type Output = Complex;
    fn add(self, rhs: Complex) -> Complex {
        Complex {
            re: self.re + rhs.re,
            im: self.im + rhs.im,
        }
    }
}

impl std::ops::Mul for Complex {
    type Output = Complex;
    fn mul(self, rhs: Complex) -> Complex {
        Complex {
            re: self.re.clone() * rhs.re.clone() - self.im.clone() * rhs.im.clone(),
            im: self.re * rhs.im + self.im * rhs.re,
        }
    }
}

// Comparison helpers.

fn cmp(op: CmpOp, float: bool, lhs: Expr, rhs: Expr) -> Cmp {
    Cmp { op, float, lhs, rhs }
}

impl IntExpr {
    pub fn eq(self, rhs: impl Into<IntExpr>) -> Cmp {
        cmp(CmpOp::Eq, false, self.0, rhs.into().0)
    }

    pub fn ne(self, rhs: impl Into<IntExpr>) -> Cmp {
        cmp(CmpOp::Neq, false, self.0, rhs.into().0)
    }

    pub fn lt(self, rhs: impl Into<IntExpr>) -> Cmp {
        cmp(CmpOp::Lt, false, self.0, rhs.into().0)
    }

    pub fn ge(self, rhs: impl Into<IntExpr>) -> Cmp {
        cmp(CmpOp::Ge, false, self.0, rhs.into().0)
    }
}

impl FloatExpr {
    pub fn lt(self, rhs: impl Into<FloatExpr>) -> Cmp {
        cmp(CmpOp::Lt, true, self.0, rhs.into().0)
    }

    pub fn ge(self, rhs: impl Into<FloatExpr>) -> Cmp {
        cmp(CmpOp::Ge, true, self.0, rhs.into().0)
    }
}

/// Aggregate a comparison over all lanes.
pub fn all(c: Cmp) -> BCond {
    BCond::All(c)
}

/// Aggregate a comparison over any lane.
pub fn any(c: Cmp) -> BCond {
    BCond::Any(c)
}

impl<E> Ptr<E> {
    /// Address of element `index` (element-indexed, 32-bit elements).
    pub fn at(self, index: IntExpr) -> IntExpr {
        IntExpr(Expr::Var(self.var)) + (index << IntExpr::from(2))
    }

    /// The bare address.
    pub fn addr(self) -> IntExpr {
        IntExpr(Expr::Var(self.var))
    }
}

/// Builds the statement tree of one kernel.
pub struct KernelBuilder {
    params: Vec<ParamKind>,
    blocks: Vec<Vec<Stmt>>,
    next_var: VarId,
}

impl KernelBuilder {
    pub fn new() -> KernelBuilder {
        KernelBuilder {
            params: Vec::new(),
            blocks: vec![Vec::new()],
            next_var: 0,
        }
    }

    fn fresh_var(&mut self) -> VarId {
        let v = self.next_var;
        self.next_var += 1;
        v
    }

    fn push(&mut self, stmt: Stmt) {
        self.blocks.last_mut().unwrap().push(stmt);
    }

    // ==================================================
    // Parameters (uniforms, in declaration order)
    // ==================================================

    pub fn uniform_int(&mut self) -> IntVar {
        assert!(
            self.next_var == self.params.len() as VarId,
            "declare all uniforms before other variables"
        );
        self.params.push(ParamKind::Int);
        IntVar(self.fresh_var())
    }

    pub fn uniform_float(&mut self) -> FloatVar {
        assert!(
            self.next_var == self.params.len() as VarId,
            "declare all uniforms before other variables"
        );
        self.params.push(ParamKind::Float);
        FloatVar(self.fresh_var())
    }

    pub fn uniform_ptr<E>(&mut self) -> Ptr<E> {
        assert!(
            self.next_var == self.params.len() as VarId,
            "declare all uniforms before other variables"
        );
        self.params.push(ParamKind::Ptr);
        Ptr { var: self.fresh_var(), _elem: PhantomData }
    }

    // ==================================================
    // Variables and assignment
    // ==================================================

    pub fn int_var(&mut self) -> IntVar {
        IntVar(self.fresh_var())
    }

    pub fn float_var(&mut self) -> FloatVar {
        FloatVar(self.fresh_var())
    }

    pub fn assign(&mut self, var: IntVar, expr: impl Into<IntExpr>) {
        self.push(Stmt::Assign { var: var.0, expr: expr.into().0 });
    }

    pub fn assign_f(&mut self, var: FloatVar, expr: impl Into<FloatExpr>) {
        self.push(Stmt::Assign { var: var.0, expr: expr.into().0 });
    }

    /// The executing QPU's index.
    pub fn qpu_num(&self) -> IntExpr {
        IntExpr(Expr::QpuNum)
    }

    /// The per-lane element indices 0..15.
    pub fn elem_num(&self) -> IntExpr {
        IntExpr(Expr::ElemNum)
    }

    // ==================================================
    // Memory
    // ==================================================

    pub fn load(&mut self, addr: IntExpr) -> IntExpr {
        IntExpr(Expr::Deref(Box::new(addr.0)))
    }

    pub fn load_f(&mut self, addr: IntExpr) -> FloatExpr {
        FloatExpr(Expr::Deref(Box::new(addr.0)))
    }

    pub fn store(&mut self, addr: IntExpr, value: impl Into<IntExpr>) {
        self.push(Stmt::Store { addr: addr.0, value: value.into().0 });
    }

    pub fn store_f(&mut self, addr: IntExpr, value: impl Into<FloatExpr>) {
        self.push(Stmt::Store { addr: addr.0, value: value.into().0 });
    }

    // ==================================================
    // Control flow
    // ==================================================

    fn nested(&mut self, f: impl FnOnce(&mut KernelBuilder)) -> Vec<Stmt> {
        self.blocks.push(Vec::new());
        f(self);
        self.blocks.pop().unwrap()
    }

    pub fn if_(
        &mut self,
        cond: BCond,
        then_: impl FnOnce(&mut KernelBuilder),
        else_: impl FnOnce(&mut KernelBuilder),
    ) {
        let then_ = self.nested(then_);
        let else_ = self.nested(else_);
        self.push(Stmt::If { cond, then_, else_ });
    }

    pub fn while_(&mut self, cond: BCond, body: impl FnOnce(&mut KernelBuilder)) {
        let body = self.nested(body);
        self.push(Stmt::While { cond, body });
    }

    /// A counted loop: `var` runs from `from` while `< to`, stepping by
    /// `step`.
    pub fn for_(
        &mut self,
        var: IntVar,
        from: impl Into<IntExpr>,
        to: impl Into<IntExpr>,
        step: impl Into<IntExpr>,
        body: impl FnOnce(&mut KernelBuilder),
    ) {
        self.assign(var, from);
        let to = to.into();
        let step = step.into();
        let mut body_stmts = self.nested(body);
        body_stmts.push(Stmt::Assign {
            var: var.0,
            expr: (IntExpr::from(var) + step).0,
        });
        self.push(Stmt::While {
            cond: BCond::Any(IntExpr::from(var).lt(to)),
            body: body_stmts,
        });
    }

    pub fn where_(
        &mut self,
        cond: Cmp,
        then_: impl FnOnce(&mut KernelBuilder),
        else_: impl FnOnce(&mut KernelBuilder),
    ) {
        let then_ = self.nested(then_);
        let else_ = self.nested(else_);
        self.push(Stmt::Where { cond, then_, else_ });
    }

    // ==================================================
    // Finish
    // ==================================================

    pub fn finish(mut self) -> Kernel {
        assert_eq!(self.blocks.len(), 1, "unbalanced control-flow blocks");
        Kernel {
            params: self.params,
            body: self.blocks.pop().unwrap(),
            num_vars: self.next_var,
        }
    }

    /// Number of variables handed out so far (grows during translation).
    pub fn var_count(&self) -> VarId {
        self.next_var
    }
}

impl Default for KernelBuilder {
    fn default() -> Self {
        KernelBuilder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expression_tree_shape() {
        let mut k = KernelBuilder::new();
        let n = k.uniform_int();
        let x = k.int_var();
        k.assign(x, n + 1);

        let kernel = k.finish();
        assert_eq!(kernel.params, vec![ParamKind::Int]);
        assert_eq!(kernel.num_vars, 2);
        assert_eq!(kernel.body.len(), 1);
        match &kernel.body[0] {
            Stmt::Assign { var: 1, expr: Expr::BinOp { op: AluOp::Add, .. } } => {}
            other => panic!("unexpected stmt {other:?}"),
        }
    }

    #[test]
    fn control_flow_nesting() {
        let mut k = KernelBuilder::new();
        let x = k.int_var();
        k.assign(x, 0);
        k.while_(any(IntExpr::from(x).lt(10)), |k| {
            k.assign(x, x + 1);
        });

        let kernel = k.finish();
        assert_eq!(kernel.body.len(), 2);
        match &kernel.body[1] {
            Stmt::While { body, .. } => assert_eq!(body.len(), 1),
            other => panic!("unexpected stmt {other:?}"),
        }
    }

    #[test]
    fn for_loop_desugars_to_while() {
        let mut k = KernelBuilder::new();
        let i = k.int_var();
        k.for_(i, 0, 16, 1, |_| {});

        let kernel = k.finish();
        // init assign + while
        assert_eq!(kernel.body.len(), 2);
        match &kernel.body[1] {
            Stmt::While { body, .. } => assert_eq!(body.len(), 1, "increment only"),
            other => panic!("unexpected stmt {other:?}"),
        }
    }

    #[test]
    fn uniforms_must_come_first() {
        let mut k = KernelBuilder::new();
        let _p = k.uniform_ptr::<IntElem>();
        let _x = k.int_var();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            k.uniform_int();
        }));
        assert!(result.is_err());
    }

    #[test]
    fn complex_multiplication_expands() {
        let a = Complex::new(FloatExpr::from(1.0), FloatExpr::from(2.0));
        let b = Complex::new(FloatExpr::from(3.0), FloatExpr::from(4.0));
        let c = a * b;
        match c.re.0 {
            Expr::BinOp { op: AluOp::FSub, .. } => {}
            other => panic!("unexpected re {other:?}"),
        }
        match c.im.0 {
            Expr::BinOp { op: AluOp::FAdd, .. } => {}
            other => panic!("unexpected im {other:?}"),
        }
    }
}
