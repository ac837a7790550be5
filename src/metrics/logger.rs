//! Logging backends for generation snapshots.

use super::GenerationSnapshot;
use crate::error::Result;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Logger trait for different backends.
pub trait MetricsLogger: Send {
    /// Log one generation snapshot.
    fn log(&mut self, snapshot: &GenerationSnapshot);

    /// Flush any buffered output.
    fn flush(&mut self);
}

/// Logger that drops everything.
#[derive(Debug, Default)]
pub struct NullLogger;

impl MetricsLogger for NullLogger {
    fn log(&mut self, _snapshot: &GenerationSnapshot) {}

    fn flush(&mut self) {}
}

/// Console logger printing a fixed-width table.
pub struct ConsoleLogger {
    log_interval: usize,
    last_logged: usize,
    show_header: bool,
}

impl ConsoleLogger {
    /// Create a console logger emitting every `log_interval` generations.
    pub fn new(log_interval: usize) -> Self {
        Self {
            log_interval: log_interval.max(1),
            last_logged: 0,
            show_header: true,
        }
    }

    fn print_header(&self) {
        println!(
            "{:>6} {:>10} {:>10} {:>8} {:>10} {:>10} {:>9} {:>10}",
            "Gen", "Evals", "Exps", "Episodes", "AvgReward", "BestFit", "OffPol", "LR"
        );
        println!("{}", "-".repeat(80));
    }
}

impl MetricsLogger for ConsoleLogger {
    fn log(&mut self, snapshot: &GenerationSnapshot) {
        if snapshot.generation < self.last_logged + self.log_interval {
            return;
        }
        if self.show_header {
            self.print_header();
            self.show_header = false;
        }
        println!(
            "{:>6} {:>10} {:>10} {:>8} {:>10.3} {:>10.3} {:>9.3} {:>10.2e}",
            snapshot.generation,
            snapshot.fitness_evaluations,
            snapshot.experiences,
            snapshot.episodes,
            snapshot.average_reward,
            snapshot.best_fitness,
            snapshot.off_policy_ratio,
            snapshot.learning_rate,
        );
        self.last_logged = snapshot.generation;
    }

    fn flush(&mut self) {
        let _ = std::io::stdout().flush();
    }
}

/// CSV logger appending one row per generation.
pub struct CsvLogger {
    writer: BufWriter<File>,
    wrote_header: bool,
}

impl CsvLogger {
    /// Create a CSV logger writing to `path`.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            wrote_header: false,
        })
    }
}

impl MetricsLogger for CsvLogger {
    fn log(&mut self, snapshot: &GenerationSnapshot) {
        if !self.wrote_header {
            let _ = writeln!(
                self.writer,
                "generation,fitness_evaluations,best_fitness,episodes,experiences,\
                 policy_updates,average_reward,best_reward,off_policy_ratio,learning_rate,cutoff"
            );
            self.wrote_header = true;
        }
        let _ = writeln!(
            self.writer,
            "{},{},{},{},{},{},{},{},{},{},{}",
            snapshot.generation,
            snapshot.fitness_evaluations,
            snapshot.best_fitness,
            snapshot.episodes,
            snapshot.experiences,
            snapshot.policy_updates,
            snapshot.average_reward,
            snapshot.best_reward,
            snapshot.off_policy_ratio,
            snapshot.learning_rate,
            snapshot.cutoff,
        );
    }

    fn flush(&mut self) {
        let _ = self.writer.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_logger_writes_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.csv");
        {
            let mut logger = CsvLogger::create(&path).unwrap();
            logger.log(&GenerationSnapshot::new(1).with_fitness(8, -2.0));
            logger.log(&GenerationSnapshot::new(2).with_fitness(16, -1.0));
            logger.flush();
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("generation,"));
        assert!(lines[1].starts_with("1,8,-2,"));
        assert!(lines[2].starts_with("2,16,-1,"));
    }

    #[test]
    fn test_console_logger_respects_interval() {
        let mut logger = ConsoleLogger::new(10);
        // Interval math only; rendering goes to stdout.
        logger.log(&GenerationSnapshot::new(5));
        assert_eq!(logger.last_logged, 0);
        logger.log(&GenerationSnapshot::new(10));
        assert_eq!(logger.last_logged, 10);
    }
}
