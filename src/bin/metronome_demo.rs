//! Real-time metronome demo
//!
//! Drives a [`Transport`] through a [`PlayControl`] against the system
//! clock and prints a click on every beat, with a bar accent.
//!
//! Usage:
//!   cargo run --bin metronome_demo                       # 120 BPM, 4/4, 8 seconds
//!   cargo run --bin metronome_demo -- --bpm 90 --bar 3   # 90 BPM, 3 beats per bar
//!   cargo run --bin metronome_demo -- --seconds 20       # run longer
//!   cargo run --bin metronome_demo -- --reverse          # count back down after half time

use std::cell::RefCell;
use std::env;
use std::rc::Rc;

use playhead::{
    get_scheduler, Clock, EngineHandle, PlayControl, Runner, SystemClock, Transport, Transported,
};

struct Options {
    bpm: f64,
    beats_per_bar: u32,
    seconds: f64,
    reverse: bool,
}

impl Options {
    fn parse() -> Result<Self, String> {
        let mut options = Options {
            bpm: 120.0,
            beats_per_bar: 4,
            seconds: 8.0,
            reverse: false,
        };
        let mut args = env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--bpm" => options.bpm = parse_value(&arg, args.next())?,
                "--bar" => options.beats_per_bar = parse_value(&arg, args.next())?,
                "--seconds" => options.seconds = parse_value(&arg, args.next())?,
                "--reverse" => options.reverse = true,
                "--help" | "-h" => {
                    println!(
                        "metronome_demo [--bpm N] [--bar N] [--seconds N] [--reverse]"
                    );
                    std::process::exit(0);
                }
                other => return Err(format!("unknown argument: {}", other)),
            }
        }
        if options.bpm <= 0.0 || options.beats_per_bar == 0 || options.seconds <= 0.0 {
            return Err("bpm, bar and seconds must be positive".to_string());
        }
        Ok(options)
    }
}

fn parse_value<T: std::str::FromStr>(flag: &str, value: Option<String>) -> Result<T, String> {
    value
        .ok_or_else(|| format!("{} needs a value", flag))
        .and_then(|v| {
            v.parse()
                .map_err(|_| format!("invalid value for {}: {}", flag, v))
        })
}

/// Prints a click for every integer beat position it crosses.
struct Click {
    beats_per_bar: u32,
    started_at: std::time::Instant,
}

impl Transported for Click {
    fn sync_position(&mut self, _time: f64, position: f64, speed: f64) -> f64 {
        if speed > 0.0 {
            position.ceil()
        } else if speed < 0.0 {
            position.floor()
        } else {
            f64::INFINITY
        }
    }

    fn advance_position(&mut self, _time: f64, position: f64, speed: f64) -> f64 {
        let beat = position.rem_euclid(f64::from(self.beats_per_bar)) as u32;
        let mark = if beat == 0 { "CLICK" } else { "click" };
        println!(
            "{:>8.3}s  beat {:>4}  {}",
            self.started_at.elapsed().as_secs_f64(),
            position,
            mark
        );
        if speed < 0.0 {
            position - 1.0
        } else {
            position + 1.0
        }
    }
}

fn main() {
    let options = match Options::parse() {
        Ok(options) => options,
        Err(message) => {
            eprintln!("{}", message);
            std::process::exit(1);
        }
    };

    let clock: Rc<dyn Clock> = Rc::new(SystemClock::new());
    let scheduler = get_scheduler(&clock);
    let transport = Transport::new(&scheduler);
    let click = EngineHandle::transported(Rc::new(RefCell::new(Click {
        beats_per_bar: options.beats_per_bar,
        started_at: std::time::Instant::now(),
    })));
    transport.add(&click).expect("fresh engine");

    let control = PlayControl::new(&scheduler);
    control
        .set(Some(&transport.as_engine()))
        .expect("fresh transport");
    // Beat positions advance at bpm / 60 beats per second.
    control.set_speed(options.bpm / 60.0);

    println!(
        "metronome: {} BPM, {} beats per bar, {} seconds",
        options.bpm, options.beats_per_bar, options.seconds
    );
    control.start();

    let runner = Runner::new(&scheduler);
    if options.reverse {
        runner.run_for(options.seconds / 2.0);
        println!("-- reversing --");
        control.set_speed(-options.bpm / 60.0);
        runner.run_for(options.seconds / 2.0);
    } else {
        runner.run_for(options.seconds);
    }
    control.stop();
    println!("done");
}
