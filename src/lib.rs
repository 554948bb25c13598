//! Sumprod: a lazy sum-product algebra over named factors
//!
//! Terms are functions of named inputs: dense tensors over finite integer
//! inputs, point masses, and Gaussian log densities over real inputs kept
//! in square-root information form. Terms combine through a single n-ary
//! contraction node (reduce with one operator, combine with another); every
//! new node is rewritten by a rule table and evaluated as far as closed
//! forms allow, and whatever remains stays lazy until substitution or
//! further reduction makes it computable.
//!
//! ```text
//! Term::contraction ──► normalize (rule table) ──► eval (pairwise search)
//!                                                     │
//!                                 tensor ops ◄────────┼────► gaussian algebra
//! ```

pub mod affine;
pub mod domain;
pub mod error;
mod eval;
pub mod gaussian;
pub mod linalg;
mod normalize;
pub mod ops;
pub mod term;

pub use domain::{Domain, Inputs};
pub use error::{ErrorKind, FactorError, Result};
pub use gaussian::{Gaussian, GaussianParams};
pub use ops::{AssocOp, UnaryOp};
pub use term::{Contraction, Delta, Tensor, Term, TermKind};
