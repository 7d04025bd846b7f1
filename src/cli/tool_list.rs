//! Tool listing

use std::fmt::Write;

use crate::core::tools::ToolExecutor;
use crate::mcp::ToolBridge;

pub fn list_tools(bridge: &ToolBridge) {
    print!("{}", format_tool_list(bridge));
}

pub fn format_tool_list(bridge: &ToolBridge) -> String {
    let tools = bridge.exposed_tools();
    let mut out = String::new();
    let _ = writeln!(out, "🧰 Available Tools");
    let _ = writeln!(out, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let mut servers = bridge.server_ids().peekable();
    if servers.peek().is_none() && bridge.problems().is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "No tool servers connected. Add [mcp_servers.<id>] to the config.");
    }
    for server in servers {
        let _ = writeln!(out);
        let _ = writeln!(out, "{server}");
        let mut any = false;
        for tool in tools.iter().filter(|tool| tool.server_origin == server) {
            any = true;
            match tool.description.as_deref().map(str::trim) {
                Some(description) if !description.is_empty() => {
                    let summary = description.lines().next().unwrap_or(description);
                    let _ = writeln!(out, "  {} - {}", tool.name, summary);
                }
                _ => {
                    let _ = writeln!(out, "  {}", tool.name);
                }
            }
        }
        if !any {
            let _ = writeln!(out, "  (no allowed tools)");
        }
    }

    if !bridge.problems().is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "⚠️  Problems");
        for problem in bridge.problems() {
            let _ = writeln!(out, "  {}: {}", problem.server_id, problem.message);
        }
    }
    out
}
