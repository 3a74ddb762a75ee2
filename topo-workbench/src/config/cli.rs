use clap::Parser;
use emulated_network::network::spec::LinkClass;
use emulated_network::transport::tcp::congestion::CongestionAlgorithm;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(about = "Emulates a declared network topology and runs commands inside its nodes")]
pub struct CliOpt {
    /// Path to the JSON file describing the topology
    #[arg(long)]
    pub config: PathBuf,

    /// The default TCP congestion control algorithm of every node (`reno` or `cubic`)
    #[arg(long = "control_algo", visible_alias = "control-algo", default_value_t = CongestionAlgorithm::Cubic)]
    pub control_algo: CongestionAlgorithm,

    /// Loss percentage applied to every link that does not touch a host
    #[arg(long = "link_loss", visible_alias = "link-loss")]
    pub link_loss: Option<f64>,

    /// File with CLI commands to run instead of reading them from stdin
    #[arg(long)]
    pub script: Option<PathBuf>,

    /// The random seed used for the emulated network (governing packet loss, jitter, TCP initial
    /// sequence numbers and ephemeral ports)
    #[arg(long, default_value_t = 42)]
    pub network_rng_seed: u64,

    /// Whether the run should be non-deterministic, i.e. using a non-constant seed for the random
    /// number generator
    #[arg(long)]
    pub non_deterministic: bool,

    /// Directory where the programs inside the nodes read and write files
    #[arg(long, default_value = ".")]
    pub workdir: PathBuf,

    /// Where to store a JSON log of every frame step (not recorded if missing)
    #[arg(long)]
    pub replay_log: Option<PathBuf>,

    /// Overrides the link class of the topology file (`tc` or `plain`)
    #[arg(long)]
    pub link_class: Option<LinkClass>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_underscore_and_dash_flags() {
        let opt = CliOpt::try_parse_from([
            "topo-workbench",
            "--config",
            "demos/dumbbell.json",
            "--control_algo",
            "reno",
            "--link_loss",
            "2.5",
        ])
        .unwrap();
        assert_eq!(opt.control_algo, CongestionAlgorithm::Reno);
        assert_eq!(opt.link_loss, Some(2.5));
        assert_eq!(opt.network_rng_seed, 42);

        let opt = CliOpt::try_parse_from([
            "topo-workbench",
            "--config",
            "demos/dumbbell.json",
            "--control-algo",
            "cubic",
            "--link-loss",
            "1",
            "--link-class",
            "plain",
        ])
        .unwrap();
        assert_eq!(opt.control_algo, CongestionAlgorithm::Cubic);
        assert_eq!(opt.link_class, Some(LinkClass::Plain));

        assert!(
            CliOpt::try_parse_from(["topo-workbench", "--config", "x", "--control_algo", "bbr"])
                .is_err()
        );
    }
}
