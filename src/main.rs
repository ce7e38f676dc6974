/*
 * This file is part of YogaVPC.
 *
 * Copyright (C) 2026 YogaVPC contributors
 *
 * YogaVPC is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License version 2 as
 * published by the Free Software Foundation.
 *
 * YogaVPC is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with YogaVPC. If not, see <https://www.gnu.org/licenses/>.
 */

use clap::Parser;
use yogavpc::cli::{run_cli, Cli};

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run_cli(&cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
