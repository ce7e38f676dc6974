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

//! YogaVPC - client for the yogavpcd platform feature daemon
//!
//! The driver itself lives in `vpc-core`; this crate is the command-line
//! front end and the blocking socket client it uses.

pub mod cli;
pub mod client;

pub use client::{socket_path, ClientError, VpcClient, SOCKET_ENV};
