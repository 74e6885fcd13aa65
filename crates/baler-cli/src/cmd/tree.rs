use baler_core::scan::{Filters, InstanceFilters, ScanTree, TreeNode};
use baler_core::Engine;

use super::CmdResult;
use crate::format::format_bytes;

pub(crate) fn run_tree(engine: &Engine, path: Option<&str>, depth: usize, json: bool) -> CmdResult {
    let config = engine.config();
    let roots: Vec<String> = match path {
        Some(p) => vec![p.to_string()],
        None => config.sources.clone(),
    };
    let filters = Filters::from_config(config, &InstanceFilters::default());

    let mut trees = Vec::with_capacity(roots.len());
    for root in &roots {
        let mut tree = ScanTree::new(root, config.scan.max_children, config.scan.max_nodes)
            .with_filters(filters.clone());
        tree.expand_to_depth(depth)?;
        trees.push(tree);
    }

    if json {
        let nodes: Vec<&TreeNode> = trees.iter().map(|t| t.root()).collect();
        println!("{}", serde_json::to_string_pretty(&nodes)?);
        return Ok(());
    }
    for (root, tree) in roots.iter().zip(&trees) {
        println!("{root}");
        print_children(tree.root(), 1);
    }
    Ok(())
}

fn print_children(node: &TreeNode, indent: usize) {
    let pad = "  ".repeat(indent);
    for child in &node.children {
        if child.is_dir {
            println!("{pad}{}/", child.name);
            print_children(child, indent + 1);
        } else {
            println!("{pad}{}  {}", child.name, format_bytes(child.size));
        }
    }
    if node.truncated {
        println!("{pad}...");
    }
}
