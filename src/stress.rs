use std::{collections::HashMap, process, thread, time::Duration};

use clap::{value_t, App, Arg, ArgMatches};
use log::{debug, error, info, warn, LevelFilter};
use semsync::{logger, BoundedBuffer, Record};

struct Options {
    size: usize,
    producers: usize,
    items_per_producer: usize,
    consumers: usize,
    items_per_consumer: usize,
    verbose: bool,
}

impl Options {
    fn from_matches(matches: &ArgMatches) -> Self {
        Self {
            size: positive(matches, "size", 10),
            producers: positive(matches, "producers", 20),
            items_per_producer: positive(matches, "items-per-producer", 10000),
            consumers: positive(matches, "consumers", 20),
            items_per_consumer: positive(matches, "items-per-consumer", 10000),
            verbose: matches.is_present("verbose"),
        }
    }

    /// Total items put and got, or `None` if either product overflows.
    fn totals(&self) -> Option<(usize, usize)> {
        let produced = self.producers.checked_mul(self.items_per_producer)?;
        let consumed = self.consumers.checked_mul(self.items_per_consumer)?;
        Some((produced, consumed))
    }
}

fn positive(matches: &ArgMatches, name: &str, default: usize) -> usize {
    match value_t!(matches, name, usize) {
        Ok(value) if value > 0 => value,
        _ => {
            warn!(
                "option --{name}: invalid value {:?}, will use default {default}",
                matches.value_of(name).unwrap_or_default()
            );
            default
        }
    }
}

fn counted(
    name: &'static str,
    short: &'static str,
    default: &'static str,
    help: &'static str,
) -> Arg<'static, 'static> {
    Arg::with_name(name)
        .short(short)
        .long(name)
        .takes_value(true)
        .default_value(default)
        .help(help)
}

struct Shared {
    buffer: BoundedBuffer<Record>,
    verbose: bool,
}

fn produce(shared: &Shared, id: usize, n: usize) {
    for i in 0..n {
        if shared.verbose {
            debug!("P{id:03} ({id}, {i})");
        }
        thread::sleep(Duration::from_micros(100));
        shared.buffer.put(Record::new(id, i as i64));
    }
}

/// Consumes `m` records, checking that each producer's values keep rising.
fn consume(shared: &Shared, id: usize, m: usize) -> Result<usize, String> {
    let mut last: HashMap<usize, i64> = HashMap::new();
    for _ in 0..m {
        thread::sleep(Duration::from_micros(100));
        let record = shared.buffer.get();
        if shared.verbose {
            debug!("C{id:03} {record}");
        }
        match last.get(&record.producer) {
            Some(&previous) if previous >= record.value => {
                return Err(format!(
                    "C{id:03} {record} when expecting ({}, X > {previous}) ==> ERROR out of sequence",
                    record.producer
                ));
            }
            _ => {
                last.insert(record.producer, record.value);
            }
        }
    }
    Ok(m)
}

fn run(options: &Options, produced: usize) -> Result<(), String> {
    let shared = Shared {
        buffer: BoundedBuffer::new(options.size),
        verbose: options.verbose,
    };

    let consumed = thread::scope(|s| {
        for id in 0..options.producers {
            let shared = &shared;
            thread::Builder::new()
                .name(format!("P{id:03}"))
                .spawn_scoped(s, move || produce(shared, id, options.items_per_producer))
                .map_err(|err| format!("spawning producer: {err}"))?;
        }

        let mut consumers = Vec::new();
        for id in 0..options.consumers {
            let shared = &shared;
            let handle = thread::Builder::new()
                .name(format!("C{id:03}"))
                .spawn_scoped(s, move || consume(shared, id, options.items_per_consumer))
                .map_err(|err| format!("spawning consumer: {err}"))?;
            consumers.push(handle);
        }

        let mut consumed = 0;
        for handle in consumers {
            match handle.join() {
                Ok(Ok(count)) => consumed += count,
                // Producers may be blocked on a buffer nobody drains anymore.
                Ok(Err(err)) => fail(&err),
                Err(_) => fail("consumer panicked"),
            }
        }
        Ok::<_, String>(consumed)
    })?;

    let snapshot = shared.buffer.snapshot();
    if produced % options.size != snapshot.input {
        return Err(format!("write cursor at {}, expected {}", snapshot.input, produced % options.size));
    }
    if consumed % options.size != snapshot.output {
        return Err(format!("read cursor at {}, expected {}", snapshot.output, consumed % options.size));
    }

    info!("The buffer when the test ends.\n{snapshot}");
    Ok(())
}

fn fail(message: &str) -> ! {
    error!("{message}");
    process::exit(1);
}

fn main() {
    if let Err(err) = logger::init() {
        eprintln!("failed to install logger: {err}");
    }

    let matches = App::new("bounded_buffer_stress")
        .about("Stress test a bounded buffer with many producers and consumers")
        .arg(counted("size", "s", "10", "Buffer capacity"))
        .arg(counted("producers", "p", "20", "Number of producer threads"))
        .arg(counted("items-per-producer", "n", "10000", "Items each producer puts"))
        .arg(counted("consumers", "c", "20", "Number of consumer threads"))
        .arg(counted("items-per-consumer", "m", "10000", "Items each consumer gets"))
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Log every put and get at debug level"),
        )
        .get_matches();
    let options = Options::from_matches(&matches);
    if options.verbose && log::max_level() < LevelFilter::Debug {
        log::set_max_level(LevelFilter::Debug);
    }

    info!("Test buffer of size {} with:", options.size);
    info!(
        " {} producers, each producing {} items.",
        options.producers, options.items_per_producer
    );
    info!(
        " {} consumers, each consuming {} items.",
        options.consumers, options.items_per_consumer
    );

    let Some((produced, consumed)) = options.totals() else {
        fail("total number of items overflows");
    };
    if produced != consumed {
        warn!(
            "total number of produced items ({produced}) not equal to the total number of consumed items ({consumed})"
        );
        if consumed > produced {
            fail("consumers would block forever waiting for missing items");
        }
        if produced - consumed > options.size {
            fail("producers would block forever on a full buffer");
        }
    }
    info!("Verbose: {}", options.verbose);

    match run(&options, produced) {
        Ok(()) => info!("====> TEST SUCCESS <===="),
        Err(err) => fail(&err),
    }
}
