use instant::{Duration, Instant};
use lockstep::{read_message, DiscoveryConfig, PlayerId, SessionBuilder};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use structopt::StructOpt;

const FPS: f64 = 60.0;

/// A rope pulled by both players. Both peers apply the same pulls on the same step,
/// so the knot ends up in the same place on both screens.
#[derive(Serialize, Deserialize, Debug, Copy, Clone)]
enum Command {
    Pull(i8),
    Rest,
}

#[derive(StructOpt)]
struct Opt {
    /// Where to send announcements. Use 127.0.0.1 to run both peers on one machine.
    #[structopt(short, long, default_value = "255.255.255.255")]
    broadcast_addr: Ipv4Addr,
    #[structopt(short, long, default_value = "47800")]
    port: u16,
    #[structopt(short, long, default_value = "8")]
    delay: u32,
    /// Seconds to wait for a peer
    #[structopt(short, long, default_value = "30")]
    timeout: u64,
    /// Steps to play before exiting
    #[structopt(short, long, default_value = "600")]
    steps: u32,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    // read cmd line arguments
    let opt = Opt::from_args();

    let config = DiscoveryConfig {
        broadcast_addr: opt.broadcast_addr,
        broadcast_port: opt.port,
        base_port: opt.port + 1,
        ..DiscoveryConfig::default()
    };

    println!("Looking for a peer on port {}...", opt.port);
    let mut sess = SessionBuilder::new()
        .with_delay(opt.delay)?
        .start_lan_session(config, Some(Duration::from_secs(opt.timeout)))?;
    println!("Connected, playing as player {}", sess.player());

    let mut rng = rand::thread_rng();
    let mut knot: i64 = 0;
    let mut last_update = Instant::now();
    let mut accumulator = Duration::ZERO;

    while sess.step() < opt.steps {
        let delta = Instant::now().duration_since(last_update);
        accumulator = accumulator.saturating_add(delta);
        last_update = Instant::now();

        while accumulator.as_secs_f64() > 1. / FPS {
            accumulator = accumulator.saturating_sub(Duration::from_secs_f64(1. / FPS));

            let advanced = sess.update(|player: PlayerId, bytes: &[u8]| {
                match read_message::<Command>(bytes) {
                    Ok((Command::Pull(strength), consumed)) => {
                        // player 0 pulls left, player 1 pulls right
                        let direction = if player == 0 { -1 } else { 1 };
                        knot += direction * i64::from(strength);
                        consumed
                    }
                    Ok((Command::Rest, consumed)) => consumed,
                    Err(e) => {
                        println!("Garbage from player {}: {}", player, e);
                        0
                    }
                }
            });

            if advanced {
                let command = if rng.gen_bool(0.5) {
                    Command::Pull(rng.gen_range(1..=5))
                } else {
                    Command::Rest
                };
                sess.add().push_message(&command)?;

                if sess.step() % 60 == 0 {
                    println!(
                        "Step {}: knot at {}, {:?}",
                        sess.step(),
                        knot,
                        sess.network_stats()
                    );
                }
            }
        }

        std::thread::sleep(Duration::from_millis(1));
    }

    println!("Done after {} steps, knot at {}", sess.step(), knot);
    Ok(())
}
