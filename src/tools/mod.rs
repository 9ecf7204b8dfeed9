pub mod browser_tool;
pub mod skill_tool;
