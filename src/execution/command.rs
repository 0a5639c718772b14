//! Turning resolved bindings into an argv.

use crate::error::{ErrorCode, Result, SplitflowError};
use crate::task::{Scalar, Value};

/// Build the argv for one instance.
///
/// A string executable is split with shell quoting rules (`"ls -l"` becomes
/// `["ls", "-l"]`); a sequence is flattened depth-first. Each argument is
/// rendered in declaration order:
///
/// - with a flag, booleans render the flag alone when true and nothing when
///   false; other values render `flag value...`
/// - without a flag, the value itself (sequences contribute every element)
pub fn resolve<'a, I>(executable: &Value, arguments: I) -> Result<Vec<String>>
where
    I: IntoIterator<Item = (&'a Value, Option<&'a str>)>,
{
    let mut argv = match executable {
        Value::Scalar(Scalar::Str(line)) => shell_words::split(line).map_err(|e| {
            SplitflowError::configuration_with_code(
                ErrorCode::CONFIG_INVALID_COMMAND,
                format!("cannot parse executable '{}': {}", line, e),
                Some("executable".to_string()),
            )
        })?,
        other => other.flatten(),
    };

    if argv.first().map_or(true, |program| program.is_empty()) {
        return Err(SplitflowError::configuration_with_code(
            ErrorCode::CONFIG_INVALID_COMMAND,
            "executable resolves to an empty command",
            Some("executable".to_string()),
        ));
    }

    for (value, flag) in arguments {
        render_argument(&mut argv, value, flag);
    }

    Ok(argv)
}

fn render_argument(argv: &mut Vec<String>, value: &Value, flag: Option<&str>) {
    match (flag, value) {
        (Some(flag), Value::Scalar(Scalar::Bool(enabled))) => {
            if *enabled {
                argv.push(flag.to_string());
            }
        }
        (Some(flag), value) => {
            argv.push(flag.to_string());
            argv.extend(value.flatten());
        }
        (None, value) => argv.extend(value.flatten()),
    }
}
