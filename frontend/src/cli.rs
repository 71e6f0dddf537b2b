//! Command line decoding.
//!
//! The option grammar uses single-dash long options (`-mmcu=avr5`,
//! `-graph=FILE`, `-no-stdout`), so the arguments are decoded by hand
//! in one pass.

use octavr_core::core::arch::{self, Arch};
use octavr_core::core::options::{RunOptions, comma_list};
use octavr_core::core::program::Leave;

pub const USAGE: &str = "\
  usage: octavr [-d] [-e ENTRY] [-m MAXCOUNT] [-mmcu=ARCH] [-s SIZE]
                [-no-log] [-no-stdin] [-no-stdout] [-no-stderr]
                [-q] [-flush] [-runtime] [-v]
                [-graph[=FILE]] [-sbox FOLDER]
                program [-args [...]]
         octavr --help
Options:
  -h            Show this help and exit.
  -args ...     Pass all following parameters as argc and argv to main.
  -d            Initialize SRAM from .data (for ELF program)
  -e ENTRY      Byte address of program entry.  Default for ENTRY is
                the entry point from the ELF program and 0 for non-ELF.
  -pm OFFSET    Set OFFSET where the program memory is seen in the
                LD's instruction address space (avrxmega3 only).
  -m MAXCOUNT   Execute at most MAXCOUNT instructions.  Supported
                suffixes are k for 1000 and M for a million.
  -s SIZE       The size of the simulated flash.  For a program built
                for ATmega8, SIZE would be 8K or 8192 or 0x2000.
  -q            Quiet operation.  Only print messages explicitly
                requested.  Pass exit status from the program.
  -runtime      Print octavr execution time.
  -v            Verbose loader and host diagnostics.
  -no-log       Disable instruction logging.  Useful when capturing
                performance data.  Logging can still be controlled by
                the running program.
  -no-stdin     Disable the getchar syscall (syscall 28).
  -no-stdout    Disable the putchar syscall (syscall 29).
  -no-stderr    Disable the stderr putchar syscall (syscall 24).
  -flush        Flush the host's stdout resp. stderr stream after each
                guest write.
  -sbox SANDBOX Provide the path to SANDBOX, a folder the target
                program can access via file I/O (syscall 26).
  -graph[=FILE] Write a .dot FILE representing the dynamic call graph.
                For the dot tool see  http://graphviz.org
  -graph-help   Show more options to control graph generation and exit.
  -mmcu=ARCH    Select instruction set for ARCH
    ARCH is one of:";

pub const GRAPH_USAGE: &str = "\
octavr can generate dot files that show the dynamic call graph
traversed during the simulation of the program.  The produced dot
file can be converted to a graphic file using dot, which is part of
the graphviz package from  http://graphviz.org

To convert dot file \"file.dot\" to the PNG graphic \"file.png\"
resp. to the SVG graphic \"file.svg\" run

    dot file.dot -Tpng -o file.png
    dot file.dot -Tsvg -o file.svg

-graph-help   Show this help and exit.
-graph[=FILE] Use FILE as file name for the dot call graph.
              If FILE is \"\" or \"-\" standard output is used.
-graph        Same as above, but compose the file name from
              the program base name and the extension .dot.
-graph-all    Show all nodes, even the ones that got no cycles
              attributed to them.
-graph-base=BASE   Account cycles to nodes only if BASE is in
              their call chain.  Default for BASE is \"main\".
-graph-reserved    Account cycles also to functions whose name
              is a reserved identifier in C, e.g. to library
              support functions like __mulsi3 from libgcc.
-graph-leaf=CLIST  A comma separated list of functions to be
              treated as leaf functions.  Costs of all sub-nodes
              will be propagated to them.
-graph-sub=CLIST   A comma separated list of functions to fully
              expand, i.e. also assign costs to all reserved
              functions they are using.
-graph-skip=CLIST  A comma separated list of functions to ignore.
              Propagate their costs up to the next appropriate
              function in the call tree.

Arguments BASE and elements of CLIST accept function names and
numbers.  Numbers are treated as byte addresses except \"0\"
which stands for the program entry point.";

/// Outcome of argument decoding.
pub enum Parsed {
    Run(Box<RunOptions>, &'static Arch),
    Help,
    GraphHelp,
}

fn usage_error(reason: String) -> Leave {
    Leave::Usage(reason)
}

fn parse_number(s: &str) -> Result<u64, ()> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map_err(|_| ())
    } else {
        s.parse().map_err(|_| ())
    }
}

/// Plain number, `k` (1000), `M` (1e6) or scientific `1e6` notation.
fn parse_count(s: &str, opt: &str) -> Result<u64, Leave> {
    let bad = || usage_error(format!("invalid number '{s}' in option '{opt}'"));

    if s.contains(['e', 'E']) && !s.starts_with("0x") && !s.starts_with("0X") {
        let (mant, exp) = s.split_once(['e', 'E']).ok_or_else(bad)?;
        let exp: u32 = exp.parse().map_err(|_| bad())?;
        let mant: f64 = mant.parse().map_err(|_| bad())?;
        if mant < 0.0 {
            return Err(bad());
        }
        let value = mant * 10f64.powi(exp as i32);
        return Ok(value as u64);
    }
    if let Some(body) = s.strip_suffix('k') {
        return Ok(1000 * parse_number(body).map_err(|_| bad())?);
    }
    if let Some(body) = s.strip_suffix('M') {
        return Ok(1_000_000 * parse_number(body).map_err(|_| bad())?);
    }
    parse_number(s).map_err(|_| bad())
}

/// Flash size: plain number or `K` (1024); must be a power of two and
/// at least 512 bytes.
fn parse_kilo(s: &str, opt: &str) -> Result<u32, Leave> {
    let bad = |what: &str| usage_error(format!("number '{s}' in option '{opt}' {what}"));

    let value = if let Some(body) = s.strip_suffix(['k', 'K']) {
        1024 * parse_number(body).map_err(|_| bad("is invalid"))? as u32
    } else {
        parse_number(s).map_err(|_| bad("is invalid"))? as u32
    };
    if !value.is_power_of_two() {
        return Err(bad("is not a power of 2"));
    }
    if value < 512 {
        return Err(bad("is too small"));
    }
    Ok(value)
}

pub fn parse(args: &[String]) -> Result<Parsed, Leave> {
    for arg in &args[1..] {
        if matches!(arg.as_str(), "?" | "-?" | "/?" | "-h" | "-help" | "--help") {
            return Ok(Parsed::Help);
        }
        if matches!(arg.as_str(), "-graph-help" | "-help-graph" | "--help=graph") {
            return Ok(Parsed::GraphHelp);
        }
    }

    let mut opts = RunOptions::default();
    let mut arch = arch::default_arch();

    let mut i = 1;
    while i < args.len() {
        let arg = args[i].as_str();
        let mut next = |i: &mut usize| -> Result<String, Leave> {
            *i += 1;
            args.get(*i)
                .cloned()
                .ok_or_else(|| usage_error(format!("missing argument after '{}'", args[*i - 1])))
        };

        match arg {
            "-d" => opts.init_sram = true,
            "-q" => opts.quiet = true,
            "-runtime" => opts.runtime = true,
            "-flush" => opts.flush = true,
            "-v" => opts.verbose = true,
            "-no-log" => opts.log = false,
            "-no-stdin" => opts.stdin_enabled = false,
            "-no-stdout" => opts.stdout_enabled = false,
            "-no-stderr" => opts.stderr_enabled = false,
            "-graph" => opts.graph = true,
            "-graph-all" => opts.graph_all = true,
            "-graph-reserved" => opts.graph_reserved = true,
            "-e" => {
                let v = next(&mut i)?;
                let entry = parse_number(&v)
                    .map_err(|_| usage_error(format!("invalid number '{v}' in option '-e'")))?;
                if entry % 2 != 0 {
                    return Err(usage_error(format!(
                        "odd byte address as ENTRY point in '-e {v}'"
                    )));
                }
                if entry >= 256 * 1024 {
                    return Err(usage_error(format!("ENTRY point is too big in '-e {v}'")));
                }
                opts.entry_point = Some(entry as u32);
            }
            "-pm" => {
                let v = next(&mut i)?;
                let offset = parse_number(&v)
                    .map_err(|_| usage_error(format!("invalid number '{v}' in option '-pm'")))?;
                if offset != 0x4000 && offset != 0x8000 {
                    return Err(usage_error(format!(
                        "OFFSET must be 0x4000 or 0x8000 in '-pm {v}'"
                    )));
                }
                opts.flash_pm_offset = Some(offset as u32);
            }
            "-m" => {
                let v = next(&mut i)?;
                opts.max_insns = parse_count(&v, "-m MAXCOUNT")?;
            }
            "-s" => {
                let v = next(&mut i)?;
                opts.flash_size = Some(parse_kilo(&v, "-s SIZE")?);
            }
            "-sbox" => {
                let v = next(&mut i)?;
                opts.sandbox = Some(v.into());
            }
            "-args" => {
                opts.guest_args = args[i + 1..].to_vec();
                i = args.len();
            }
            _ => {
                if let Some(name) = arg.strip_prefix("-mmcu=") {
                    arch = arch::find(name)
                        .ok_or_else(|| usage_error(format!("unknown ARCH '{name}'")))?;
                } else if let Some(file) = arg.strip_prefix("-graph=") {
                    opts.graph = true;
                    opts.graph_filename = Some(file.to_string());
                } else if let Some(base) = arg.strip_prefix("-graph-base=") {
                    opts.graph_base = Some(base.to_string());
                } else if let Some(list) = arg.strip_prefix("-graph-leaf=") {
                    opts.graph_leaf = comma_list(list);
                } else if let Some(list) = arg.strip_prefix("-graph-sub=") {
                    opts.graph_sub = comma_list(list);
                } else if let Some(list) = arg.strip_prefix("-graph-skip=") {
                    opts.graph_skip = comma_list(list);
                } else if arg.starts_with('-') {
                    return Err(usage_error(format!("unknown option '{arg}'")));
                } else if opts.program_path.is_some() {
                    return Err(usage_error(format!("duplicate program name '{arg}'")));
                } else {
                    opts.program_path = Some(arg.into());
                }
            }
        }
        i += 1;
    }

    if opts.program_path.is_none() {
        return Err(usage_error("missing program name".into()));
    }
    if opts.flash_pm_offset.is_some() && arch.name != "avrxmega3" {
        return Err(usage_error("'-pm OFFSET' is only valid for avrxmega3".into()));
    }

    Ok(Parsed::Run(Box::new(opts), arch))
}

/// The usage synopsis with the registered arch list appended.
pub fn usage_text() -> String {
    let mut text = USAGE.to_string();
    for a in arch::all() {
        text.push(' ');
        text.push_str(a.name);
    }
    text.push('\n');
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        std::iter::once("octavr")
            .chain(args.iter().copied())
            .map(str::to_owned)
            .collect()
    }

    #[test]
    fn parses_basic_flags() {
        let Parsed::Run(opts, arch) = parse(&argv(&[
            "-d", "-q", "-m", "100k", "-mmcu=avr6", "prog.elf",
        ]))
        .unwrap() else {
            panic!("expected run");
        };
        assert!(opts.init_sram && opts.quiet);
        assert_eq!(opts.max_insns, 100_000);
        assert_eq!(arch.name, "avr6");
        assert_eq!(opts.program_path.as_ref().unwrap().to_str(), Some("prog.elf"));
    }

    #[test]
    fn parses_counts_and_sizes() {
        let Parsed::Run(opts, _) =
            parse(&argv(&["-m", "2M", "-s", "128K", "p.bin"])).unwrap()
        else {
            panic!()
        };
        assert_eq!(opts.max_insns, 2_000_000);
        assert_eq!(opts.flash_size, Some(128 * 1024));

        let Parsed::Run(opts, _) = parse(&argv(&["-m", "1e6", "p.bin"])).unwrap() else {
            panic!()
        };
        assert_eq!(opts.max_insns, 1_000_000);
    }

    #[test]
    fn rejects_bad_sizes() {
        assert!(parse(&argv(&["-s", "100", "p.bin"])).is_err()); // not 2^n
        assert!(parse(&argv(&["-s", "256", "p.bin"])).is_err()); // too small
        assert!(parse(&argv(&["-e", "3", "p.bin"])).is_err()); // odd entry
    }

    #[test]
    fn graph_options() {
        let Parsed::Run(opts, _) = parse(&argv(&[
            "-graph=out.dot",
            "-graph-base=main",
            "-graph-leaf=f,g",
            "p.elf",
        ]))
        .unwrap() else {
            panic!()
        };
        assert!(opts.graph);
        assert_eq!(opts.graph_filename.as_deref(), Some("out.dot"));
        assert_eq!(opts.graph_base.as_deref(), Some("main"));
        assert_eq!(opts.graph_leaf, ["f", "g"]);
    }

    #[test]
    fn args_swallow_the_rest() {
        let Parsed::Run(opts, _) =
            parse(&argv(&["p.elf", "-args", "-q", "x"])).unwrap()
        else {
            panic!()
        };
        assert!(!opts.quiet);
        assert_eq!(opts.guest_args, ["-q", "x"]);
    }

    #[test]
    fn requires_program() {
        assert!(matches!(
            parse(&argv(&["-q"])),
            Err(Leave::Usage(_))
        ));
    }
}
