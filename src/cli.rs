use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "ws-link")]
#[command(author, version, about = "Mutually authenticated TLS WebSocket link", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 日志级别 (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 运行服务端，回显收到的消息
    Server {
        /// 配置文件路径
        #[arg(short, long, default_value = "server.toml")]
        config: String,
    },
    /// 运行客户端，回显收到的消息
    Client {
        /// 配置文件路径
        #[arg(short, long, default_value = "client.toml")]
        config: String,
    },
    /// 生成自签名证书
    Cert {
        /// 证书输出路径
        #[arg(long, default_value = "cert.pem")]
        cert_out: String,

        /// 私钥输出路径
        #[arg(long, default_value = "key.pem")]
        key_out: String,

        /// 证书的 Common Name
        #[arg(long, default_value = "localhost")]
        common_name: String,

        /// 证书的 SubjectAltName（用逗号分隔多个）
        #[arg(long, value_delimiter = ',', value_name = "DNS,...")]
        alt_names: Vec<String>,
    },
    /// 检查配置文件格式是否正确
    Check {
        /// 配置文件路径
        #[arg(short, long)]
        config: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_server() {
        let cli = Cli::parse_from(["ws-link", "server", "-c", "center.toml", "-l", "debug"]);
        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Server { config } => assert_eq!(config, "center.toml"),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_cert_alt_names() {
        let cli = Cli::parse_from([
            "ws-link",
            "cert",
            "--common-name",
            "center",
            "--alt-names",
            "localhost,127.0.0.1",
        ]);
        match cli.command {
            Commands::Cert {
                common_name,
                alt_names,
                cert_out,
                ..
            } => {
                assert_eq!(common_name, "center");
                assert_eq!(alt_names, vec!["localhost", "127.0.0.1"]);
                assert_eq!(cert_out, "cert.pem");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
