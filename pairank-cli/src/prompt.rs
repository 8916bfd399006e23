/// Interactive terminal prompts: "which do you prefer?" and "save failed, now what?".
///
/// Reads one line per answer. End of input counts as quitting.
use std::io::{BufRead, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Choice {
    First,
    Second,
    Undo,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    Retry,
    Skip,
    Quit,
}

pub fn parse_choice(input: &str) -> Option<Choice> {
    match input.trim().to_ascii_lowercase().as_str() {
        "1" => Some(Choice::First),
        "2" => Some(Choice::Second),
        "u" | "undo" => Some(Choice::Undo),
        "q" | "quit" => Some(Choice::Quit),
        _ => None,
    }
}

pub fn parse_recovery(input: &str, allow_skip: bool) -> Option<Recovery> {
    match input.trim().to_ascii_lowercase().as_str() {
        "r" | "retry" | "" => Some(Recovery::Retry),
        "s" | "skip" if allow_skip => Some(Recovery::Skip),
        "q" | "quit" => Some(Recovery::Quit),
        _ => None,
    }
}

pub struct Prompter<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> Prompter<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Prompter { input, output }
    }

    fn read_answer(&mut self) -> Option<String> {
        let _ = self.output.flush();
        let mut line = String::new();
        match self.input.read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line),
        }
    }

    /// Ask which of two titles the user prefers.
    pub fn choose(&mut self, progress: Option<(usize, usize)>, first: &str, second: &str) -> Choice {
        let _ = writeln!(self.output);
        if let Some((current, total)) = progress {
            let _ = writeln!(self.output, "[{}/{}]", current + 1, total);
        }
        let _ = writeln!(self.output, "Which do you prefer?");
        let _ = writeln!(self.output, "  1) {first}");
        let _ = writeln!(self.output, "  2) {second}");
        loop {
            let _ = write!(self.output, "1/2, u = undo, q = quit > ");
            let Some(line) = self.read_answer() else {
                return Choice::Quit;
            };
            match parse_choice(&line) {
                Some(choice) => return choice,
                None => {
                    let _ = writeln!(self.output, "Please answer 1, 2, u or q.");
                }
            }
        }
    }

    /// Ask what to do after a failed save.
    pub fn recover(&mut self, message: &str, allow_skip: bool) -> Recovery {
        let _ = writeln!(self.output, "{message}");
        let options = if allow_skip { "r = retry, s = skip, q = quit" } else { "r = retry, q = quit" };
        loop {
            let _ = write!(self.output, "{options} > ");
            let Some(line) = self.read_answer() else {
                return Recovery::Quit;
            };
            match parse_recovery(&line, allow_skip) {
                Some(recovery) => return recovery,
                None => {
                    let _ = writeln!(self.output, "Please answer with one of: {options}.");
                }
            }
        }
    }

    pub fn say(&mut self, message: impl std::fmt::Display) {
        let _ = writeln!(self.output, "{message}");
    }
}
