// SPDX-FileCopyrightText: 2025 The seedcore Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod cli;
pub mod command;
pub mod config;
pub mod disk_scheduler;
pub mod errors;
pub mod storage;
pub mod torrent_file;
pub mod torrent_manager;
