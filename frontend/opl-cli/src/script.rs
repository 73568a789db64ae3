//! Register write scripts
//!
//! One command per line, `#` starts a comment:
//!
//! ```text
//! w <register> <value>   register write, both in hex
//! wait <samples>         render this many samples
//! scale <range>          set the output scale, 4096 = unity gain
//! ```

use std::num::ParseIntError;
use thiserror::Error;
use ym_opl::FmChip;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Write { register: u8, value: u8 },
    Wait(u32),
    Scale(i16),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    #[error("line {line}: unknown command '{command}'")]
    UnknownCommand { line: usize, command: String },
    #[error("line {line}: '{command}' expects {expected} argument(s), got {actual}")]
    WrongArgumentCount { line: usize, command: String, expected: usize, actual: usize },
    #[error("line {line}: invalid number '{value}': {source}")]
    InvalidNumber {
        line: usize,
        value: String,
        #[source]
        source: ParseIntError,
    },
}

fn parse_hex_u8(line: usize, value: &str) -> Result<u8, ScriptError> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix('$'))
        .unwrap_or(value);
    u8::from_str_radix(digits, 16).map_err(|source| ScriptError::InvalidNumber {
        line,
        value: value.into(),
        source,
    })
}

fn parse_decimal<T: std::str::FromStr<Err = ParseIntError>>(
    line: usize,
    value: &str,
) -> Result<T, ScriptError> {
    value.parse().map_err(|source| ScriptError::InvalidNumber { line, value: value.into(), source })
}

/// # Errors
///
/// Returns an error on the first malformed line. Line numbers in errors are 1-based.
pub fn parse(text: &str) -> Result<Vec<Command>, ScriptError> {
    let mut commands = Vec::new();

    for (i, line) in text.lines().enumerate() {
        let line_number = i + 1;
        let line = line.split_once('#').map_or(line, |(before, _)| before);

        let mut tokens = line.split_whitespace();
        let Some(command) = tokens.next() else { continue };
        let arguments: Vec<_> = tokens.collect();

        let expected = match command {
            "w" => 2,
            "wait" | "scale" => 1,
            _ => {
                return Err(ScriptError::UnknownCommand {
                    line: line_number,
                    command: command.into(),
                });
            }
        };
        if arguments.len() != expected {
            return Err(ScriptError::WrongArgumentCount {
                line: line_number,
                command: command.into(),
                expected,
                actual: arguments.len(),
            });
        }

        let command = match command {
            "w" => Command::Write {
                register: parse_hex_u8(line_number, arguments[0])?,
                value: parse_hex_u8(line_number, arguments[1])?,
            },
            "wait" => Command::Wait(parse_decimal(line_number, arguments[0])?),
            "scale" => Command::Scale(parse_decimal(line_number, arguments[0])?),
            _ => unreachable!("command was matched above"),
        };
        commands.push(command);
    }

    Ok(commands)
}

/// Play `commands` through `chip`, returning every rendered sample.
pub fn run(commands: &[Command], chip: &mut dyn FmChip) -> Vec<i16> {
    let mut samples = Vec::new();

    for &command in commands {
        match command {
            Command::Write { register, value } => {
                chip.write(0, register);
                chip.write(1, value);
            }
            Command::Wait(count) => {
                let start = samples.len();
                samples.resize(start + count as usize, 0);
                chip.render(&mut samples[start..]);
            }
            Command::Scale(range) => chip.set_output_scale(range),
        }
    }

    samples
}
