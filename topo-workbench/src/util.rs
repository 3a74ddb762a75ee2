use emulated_network::Network;
use emulated_network::network::spec::LinkClass;

/// How the `--link_loss` flag affects the core links
pub fn describe_link_loss(loss: Option<f64>, link_class: LinkClass) -> String {
    match (loss, link_class) {
        (None, _) => "as configured".to_string(),
        (Some(loss), LinkClass::Tc) => format!("{loss}%"),
        (Some(loss), LinkClass::Plain) => format!("{loss}% (ignored by the plain link class)"),
    }
}

pub fn print_link_stats(network: &Network) {
    let stats = network.link_stats();
    if !stats.by_link.is_empty() {
        println!("--- Link stats ---");
    }

    for (link_id, stats) in &stats.by_link {
        println!("* {link_id}:");
        if let Some(link) = network.link(link_id) {
            let shaping = link.shaping();
            if !shaping.is_default() {
                println!("|-> Shaping: {}", shaping.describe());
            }
        }

        println!(
            "|-> Transmitted {} packets ({} bytes)",
            stats.transmitted.packets, stats.transmitted.bytes
        );

        let dropped = stats.dropped();
        println!(
            "|-> Dropped {} packets ({} bytes)",
            dropped.packets, dropped.bytes
        );
        if dropped.packets > 0 {
            println!(
                "    | {} lost in transit, {} on a full queue, {} while the link was down",
                stats.dropped_random_loss.packets,
                stats.dropped_queue_full.packets,
                stats.dropped_link_down.packets
            );
        }

        println!("|-> Max queue length: {} packets", stats.max_queue_len);
    }
}
