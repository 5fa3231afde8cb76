//! Backend-neutral query spec model.
//!
//! Pure data plus validation, no I/O. Every connector consumes these types
//! unchanged, which is what keeps backends interchangeable.

pub mod spec;
pub mod value;

pub use spec::{
    Combinator, Condition, ConditionList, DeleteSpec, Direction, FilterNode, InsertSpec, Operand,
    Operator, OrderItem, QueryLimits, QuerySpec, QuerySpecBuilder, UpdateSpec, MAX_FILTER_DEPTH,
};
pub use value::{Record, Value};
