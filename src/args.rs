use std::net::Ipv4Addr;

use clap::Parser;

fn parse_dst(s: &str) -> Result<Ipv4Addr, String> {
    let addr: Ipv4Addr = s
        .parse()
        .map_err(|_| format!("invalid IPv4 address: {s}"))?;
    if addr.is_unspecified() || addr.is_broadcast() {
        return Err(format!("destination cannot be {addr}"));
    }
    Ok(addr)
}

#[derive(Parser, Debug, Clone)]
#[command(name = "remaprt")]
#[command(about = "Remap the diverged segment of a previously measured network path")]
#[command(version)]
pub struct Args {
    /// Name of the interface to probe through (e.g. eth0)
    #[arg(short = 'i', long = "iface")]
    pub iface: String,

    /// Old path in hop notation: HOP|HOP|...|HOP, HOP := IFACE;...;IFACE,
    /// IFACE := ip:flowids:rttmin,rttavg,rttmax,rttvar:flags
    #[arg(short = 'o', long = "old-path")]
    pub old_path: String,

    /// IPv4 address of the destination
    #[arg(short = 'd', long = "dst", value_parser = parse_dst)]
    pub dst: Ipv4Addr,

    /// One-based TTL where to start the remap
    #[arg(short = 't', long = "ttl", value_parser = clap::value_parser!(u8).range(1..))]
    pub ttl: u8,

    /// Base name for the log file
    #[arg(short = 'l', long = "logbase")]
    pub logbase: String,

    /// ICMP identifier used to match probes to replies
    #[arg(short = 'x', long = "icmpid", value_parser = clap::value_parser!(u16).range(1..))]
    pub icmpid: u16,

    /// Replay against this new path instead of probing (offline mode)
    #[arg(short = 'n', long = "new-path")]
    pub new_path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const OLD: &str = "10.0.0.1:0:1.00,1.00,1.00,1.00:|10.0.0.2:0:2.00,2.00,2.00,2.00:";

    fn base_args() -> Vec<String> {
        [
            "remaprt", "-i", "eth0", "-o", OLD, "-d", "10.0.0.2", "-t", "2", "-l", "remap", "-x",
            "4242",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    #[test]
    fn test_args_full_set() {
        let args = Args::try_parse_from(base_args()).unwrap();
        assert_eq!(args.iface, "eth0");
        assert_eq!(args.old_path, OLD);
        assert_eq!(args.dst, "10.0.0.2".parse::<Ipv4Addr>().unwrap());
        assert_eq!(args.ttl, 2);
        assert_eq!(args.logbase, "remap");
        assert_eq!(args.icmpid, 4242);
        assert!(args.new_path.is_none());
    }

    #[test]
    fn test_args_offline_replay() {
        let mut argv = base_args();
        argv.extend(["-n".to_string(), OLD.to_string()]);
        let args = Args::try_parse_from(argv).unwrap();
        assert_eq!(args.new_path.as_deref(), Some(OLD));
    }

    #[test]
    fn test_args_missing_required() {
        assert!(Args::try_parse_from(["remaprt", "-i", "eth0"]).is_err());
    }

    #[test]
    fn test_args_rejects_bad_dst() {
        for dst in ["0.0.0.0", "255.255.255.255", "not-an-ip"] {
            let mut argv = base_args();
            argv[6] = dst.to_string();
            assert!(Args::try_parse_from(argv).is_err(), "dst {dst}");
        }
    }

    #[test]
    fn test_args_rejects_zero_ttl() {
        let mut argv = base_args();
        argv[8] = "0".to_string();
        assert!(Args::try_parse_from(argv).is_err());
    }

    #[test]
    fn test_args_long_flags() {
        let args = Args::try_parse_from([
            "remaprt",
            "--iface",
            "wlan0",
            "--old-path",
            OLD,
            "--dst",
            "10.0.0.2",
            "--ttl",
            "7",
            "--logbase",
            "/tmp/remap",
            "--icmpid",
            "99",
        ])
        .unwrap();
        assert_eq!(args.iface, "wlan0");
        assert_eq!(args.ttl, 7);
    }
}
