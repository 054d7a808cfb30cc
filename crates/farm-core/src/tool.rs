//! Command line for the external flow tool.

use crate::script::shell_quote;
use crate::types::JobInfo;
use serde::{Deserialize, Serialize};

/// Arguments for one flow run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Path to the design source on the execution host.
    pub input: String,
    /// Top module name.
    pub top: String,
    #[serde(default)]
    pub pdk: Option<String>,
    #[serde(default)]
    pub frequency_mhz: Option<f64>,
    #[serde(default)]
    pub clock_port: Option<String>,
    /// Produce a layout (`--gds`).
    #[serde(default)]
    pub produce_layout: bool,
    /// Run DRC/LVS signoff (`--signoff`).
    #[serde(default)]
    pub run_signoff: bool,
    /// Passed through verbatim after the known flags.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl ToolInvocation {
    /// Render the shell command that runs `tool_bin` writing into `output_dir`.
    pub fn command(&self, tool_bin: &str, output_dir: &str) -> String {
        let mut parts = vec![
            shell_quote(tool_bin),
            "--input".to_string(),
            shell_quote(&self.input),
            "--top".to_string(),
            shell_quote(&self.top),
        ];
        if let Some(pdk) = &self.pdk {
            parts.push("--pdk".to_string());
            parts.push(shell_quote(pdk));
        }
        if let Some(freq) = self.frequency_mhz {
            parts.push("--freq".to_string());
            parts.push(freq.to_string());
        }
        if let Some(clock) = &self.clock_port {
            parts.push("--clock".to_string());
            parts.push(shell_quote(clock));
        }
        parts.push("--output".to_string());
        parts.push(shell_quote(output_dir));
        if self.produce_layout {
            parts.push("--gds".to_string());
        }
        if self.run_signoff {
            parts.push("--signoff".to_string());
        }
        parts.extend(self.extra_args.iter().map(|arg| shell_quote(arg)));
        parts.join(" ")
    }

    /// Metadata description of this run.
    pub fn info(&self, tool: &str) -> JobInfo {
        JobInfo {
            tool: tool.to_string(),
            design: self.top.clone(),
            frequency_mhz: self.frequency_mhz,
            pdk: self.pdk.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_invocation() {
        let inv = ToolInvocation {
            input: "/work/counter.v".to_string(),
            top: "counter".to_string(),
            ..Default::default()
        };
        assert_eq!(
            inv.command("flow", "/tmp/j1/output"),
            "'flow' --input '/work/counter.v' --top 'counter' --output '/tmp/j1/output'"
        );
    }

    #[test]
    fn full_invocation_orders_flags() {
        let inv = ToolInvocation {
            input: "/work/alu.v".to_string(),
            top: "alu".to_string(),
            pdk: Some("sky130".to_string()),
            frequency_mhz: Some(62.5),
            clock_port: Some("clk".to_string()),
            produce_layout: true,
            run_signoff: true,
            extra_args: vec!["--seed=3".to_string()],
        };
        assert_eq!(
            inv.command("/opt/flow/bin/flow", "/j/output"),
            "'/opt/flow/bin/flow' --input '/work/alu.v' --top 'alu' --pdk 'sky130' \
             --freq 62.5 --clock 'clk' --output '/j/output' --gds --signoff '--seed=3'"
        );
    }

    #[test]
    fn hostile_values_stay_quoted() {
        let inv = ToolInvocation {
            input: "/work/a b;rm -rf ~.v".to_string(),
            top: "it's".to_string(),
            ..Default::default()
        };
        let cmd = inv.command("flow", "/o");
        assert!(cmd.contains("'/work/a b;rm -rf ~.v'"));
        assert!(cmd.contains(r"'it'\''s'"));
    }

    #[test]
    fn info_describes_run() {
        let inv = ToolInvocation {
            top: "counter".to_string(),
            frequency_mhz: Some(100.0),
            pdk: Some("gf180".to_string()),
            ..Default::default()
        };
        let info = inv.info("flow");
        assert_eq!(info.tool, "flow");
        assert_eq!(info.design, "counter");
        assert_eq!(info.frequency_mhz, Some(100.0));
        assert_eq!(info.pdk.as_deref(), Some("gf180"));
    }
}
