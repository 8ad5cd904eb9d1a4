//! Condition evaluation for `if` / `unless` actions

use crate::config::{Action, LaunchContext, Resolve, ResolutionError, Substitution};

/// Interpret a resolved condition string. Only `true` and `false` are accepted.
pub fn parse_condition(value: &str) -> Result<bool, ResolutionError> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(ResolutionError::InvalidCondition(other.to_string())),
    }
}

/// Resolve `expr` and interpret it as a boolean, inverted when `negate` is set
pub fn evaluate_condition(
    expr: &Substitution,
    negate: bool,
    ctx: &LaunchContext,
    resolver: &dyn Resolve,
) -> Result<bool, ResolutionError> {
    let value = parse_condition(&resolver.resolve(expr, ctx)?)?;
    Ok(value != negate)
}

/// Decide whether an action should run. Unconditioned actions always run.
pub fn should_run(
    action: &Action,
    ctx: &LaunchContext,
    resolver: &dyn Resolve,
) -> Result<bool, ResolutionError> {
    match action {
        Action::If(conditional) => evaluate_condition(&conditional.condition, false, ctx, resolver),
        Action::Unless(conditional) => {
            evaluate_condition(&conditional.condition, true, ctx, resolver)
        }
        _ => Ok(true),
    }
}
