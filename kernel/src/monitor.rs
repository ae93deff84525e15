//! Kernel monitor (spec.md 6). A tiny command line that runs entirely in
//! the fault/breakpoint path; parsing is pure and testable, execution of
//! the few commands that need real hardware (`testint`, `si`) is not.

use alloc::string::String;
use alloc::vec::Vec;

use crate::mm::VirtAddr;

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Help,
    KernInfo,
    Backtrace,
    ShowMappings { lo: u32, hi: Option<u32> },
    ChMappingPerm { add: bool, user: bool, writable: bool, va: u32 },
    MemDump { virt: bool, lo: u32, hi: u32 },
    TestInt { vector: u32 },
    SingleStep,
    Exit,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    Empty,
    Unknown,
    BadArgs,
}

fn parse_hex(s: &str) -> Result<u32, ParseError> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u32::from_str_radix(s, 16).map_err(|_| ParseError::BadArgs)
}

/// Splits on whitespace and matches the literal command surface (6).
/// `showmappings`/`chmappingperm`/`memdump` take hex addresses.
pub fn parse(line: &str) -> Result<Command, ParseError> {
    let mut parts = line.split_whitespace();
    let cmd = parts.next().ok_or(ParseError::Empty)?;
    let rest: Vec<&str> = parts.collect();

    match cmd {
        "help" => Ok(Command::Help),
        "kerninfo" => Ok(Command::KernInfo),
        "backtrace" => Ok(Command::Backtrace),
        "si" => Ok(Command::SingleStep),
        "exit" => Ok(Command::Exit),
        "showmappings" => match rest.as_slice() {
            [lo] => Ok(Command::ShowMappings { lo: parse_hex(lo)?, hi: None }),
            [lo, hi] => Ok(Command::ShowMappings { lo: parse_hex(lo)?, hi: Some(parse_hex(hi)?) }),
            _ => Err(ParseError::BadArgs),
        },
        "chmappingperm" => match rest.as_slice() {
            [spec, va] => {
                let mut chars = spec.chars();
                let sign = chars.next().ok_or(ParseError::BadArgs)?;
                let add = match sign {
                    '+' => true,
                    '-' => false,
                    _ => return Err(ParseError::BadArgs),
                };
                let mut user = false;
                let mut writable = false;
                for c in chars {
                    match c {
                        'U' => user = true,
                        'W' => writable = true,
                        _ => return Err(ParseError::BadArgs),
                    }
                }
                Ok(Command::ChMappingPerm { add, user, writable, va: parse_hex(va)? })
            }
            _ => Err(ParseError::BadArgs),
        },
        "memdump" => match rest.as_slice() {
            [lo, hi] => Ok(Command::MemDump { virt: true, lo: parse_hex(lo)?, hi: parse_hex(hi)? }),
            [mode, lo, hi] => {
                let virt = match *mode {
                    "vp" => true,
                    "pp" => false,
                    _ => return Err(ParseError::BadArgs),
                };
                Ok(Command::MemDump { virt, lo: parse_hex(lo)?, hi: parse_hex(hi)? })
            }
            _ => Err(ParseError::BadArgs),
        },
        "testint" => match rest.as_slice() {
            [n] => Ok(Command::TestInt { vector: parse_hex(n)? }),
            _ => Err(ParseError::BadArgs),
        },
        _ => Err(ParseError::Unknown),
    }
}

pub const HELP_TEXT: &str = "\
help            display this list of commands
kerninfo        display information about the kernel
backtrace       print a backtrace of the current call stack
showmappings    show page mappings in a virtual address range
chmappingperm   change the permission bits on a page mapping
memdump         dump memory in a virtual or physical address range
testint         trigger a software interrupt for testing
si              single-step the current instruction
exit            leave the monitor and resume";

/// One line of `showmappings` output, built from a page-table lookup
/// (kept separate from the formatting so main.rs can feed it real
/// frame/flags data without this module touching `PhysMemory`).
pub fn format_mapping(va: VirtAddr, frame: Option<u32>, flags: u32) -> String {
    use core::fmt::Write;
    let mut out = String::new();
    match frame {
        Some(frame) => {
            let _ = write!(out, "{:#010x} -> frame {:#06x} flags {:#05x}", va.as_u32(), frame, flags);
        }
        None => {
            let _ = write!(out, "{:#010x} -> not mapped", va.as_u32());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn help_and_bare_commands_parse() {
        assert_eq!(parse("help"), Ok(Command::Help));
        assert_eq!(parse("kerninfo"), Ok(Command::KernInfo));
        assert_eq!(parse("exit"), Ok(Command::Exit));
    }

    #[test]
    fn showmappings_takes_one_or_two_addresses() {
        assert_eq!(parse("showmappings 0x1000"), Ok(Command::ShowMappings { lo: 0x1000, hi: None }));
        assert_eq!(
            parse("showmappings 1000 2000"),
            Ok(Command::ShowMappings { lo: 0x1000, hi: Some(0x2000) })
        );
    }

    #[test]
    fn chmappingperm_parses_sign_and_flag_letters() {
        assert_eq!(
            parse("chmappingperm +W 0x3000"),
            Ok(Command::ChMappingPerm { add: true, user: false, writable: true, va: 0x3000 })
        );
        assert_eq!(
            parse("chmappingperm -UW 0x3000"),
            Ok(Command::ChMappingPerm { add: false, user: true, writable: true, va: 0x3000 })
        );
    }

    #[test]
    fn unknown_command_is_an_error() {
        assert_eq!(parse("frobnicate"), Err(ParseError::Unknown));
    }

    #[test]
    fn bad_hex_argument_is_an_error() {
        assert_eq!(parse("showmappings zzz"), Err(ParseError::BadArgs));
    }
}
