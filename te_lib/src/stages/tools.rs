//! Command lines for the external tools.

use job_runner::CommandLine;
use std::path::Path;

const GIB: u64 = 1 << 30;

/// Whole gigabytes, at least 1.
fn memory_gb(bytes: u64) -> u64 {
    (bytes / GIB).max(1)
}

/// `cellranger count` for one sample, creating `<cwd>/<sample_id>/`.
pub fn cellranger_count(
    sample_id: &str,
    transcriptome: &Path,
    fastqs: &Path,
    is_nuclei: bool,
    cores: usize,
    memory_bytes: u64,
) -> CommandLine {
    CommandLine::new("cellranger")
        .arg("count")
        .kv("--id", sample_id)
        .kv("--transcriptome", transcriptome.display())
        .kv("--fastqs", fastqs.display())
        .kv("--sample", sample_id)
        .kv("--localcores", cores)
        .kv("--localmem", memory_gb(memory_bytes))
        .flag_if(is_nuclei, "--include-introns=true")
}

/// The BAM subsetting worker shipped with this pipeline.
pub fn subset_bam(worker_exe: &Path, bam: &Path, routes: &Path, unique_only: bool) -> CommandLine {
    CommandLine::new(&worker_exe.display().to_string())
        .arg("subset-bam")
        .opt("--bam", bam.display())
        .opt("--routes", routes.display())
        .flag_if(unique_only, "--unique")
}

pub fn samtools_merge<'a>(
    out: &Path,
    inputs: impl IntoIterator<Item = &'a Path>,
    cores: usize,
) -> CommandLine {
    CommandLine::new("samtools")
        .arg("merge")
        .arg("-f")
        .opt("-@", cores)
        .path(out)
        .args(inputs.into_iter().map(|p| p.display().to_string()))
}

pub fn samtools_fastq(bam: &Path, fastq: &Path, cores: usize) -> CommandLine {
    CommandLine::new("samtools")
        .arg("fastq")
        .opt("-@", cores)
        .path(bam)
        .raw(">")
        .path(fastq)
}

/// STAR alignment to a coordinate-sorted BAM. Multi-mappers are kept (up to
/// 100 loci) unless `unique_only`.
pub fn star_align(
    star_index: &Path,
    fastq: &Path,
    out_prefix: &Path,
    cores: usize,
    unique_only: bool,
) -> CommandLine {
    CommandLine::new("STAR")
        .opt("--runThreadN", cores)
        .opt("--genomeDir", star_index.display())
        .opt("--readFilesIn", fastq.display())
        .opt("--outFileNamePrefix", out_prefix.display())
        .args(["--outSAMtype", "BAM", "SortedByCoordinate"])
        .args(["--outSAMattributes", "NH", "HI", "AS", "nM"])
        .opt("--outFilterMultimapNmax", if unique_only { 1 } else { 100 })
        .opt("--winAnchorMultimapNmax", 100)
}

/// TEcount writes `<outdir>/<project>.cntTable`.
pub fn tecount(
    bam: &Path,
    gene_gtf: &Path,
    te_gtf: &Path,
    outdir: &Path,
    project: &str,
    unique_only: bool,
) -> CommandLine {
    CommandLine::new("TEcount")
        .opt("-b", bam.display())
        .opt("--GTF", gene_gtf.display())
        .opt("--TE", te_gtf.display())
        .opt("--format", "BAM")
        .opt("--mode", if unique_only { "uniq" } else { "multi" })
        .opt("--project", project)
        .opt("--outdir", outdir.display())
}

/// featureCounts gene pass; `-M` counts multi-mapped reads unless `unique_only`.
pub fn featurecounts(
    bam: &Path,
    gene_gtf: &Path,
    out: &Path,
    cores: usize,
    unique_only: bool,
) -> CommandLine {
    CommandLine::new("featureCounts")
        .opt("-T", cores)
        .flag_if(!unique_only, "-M")
        .opt("-a", gene_gtf.display())
        .opt("-o", out.display())
        .path(bam)
}

pub fn mkdir(dir: &Path) -> CommandLine {
    CommandLine::new("mkdir").arg("-p").path(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cellranger_count() {
        let cmd = cellranger_count(
            "AA_ASAP101",
            Path::new("/ref/GRCh38"),
            Path::new("/raw/101"),
            true,
            10,
            64 * GIB,
        );
        assert_eq!(
            cmd.to_string(),
            "cellranger count --id=AA_ASAP101 --transcriptome=/ref/GRCh38 --fastqs=/raw/101 \
             --sample=AA_ASAP101 --localcores=10 --localmem=64 --include-introns=true"
        );
    }

    #[test]
    fn test_unique_switches() {
        let star = star_align(Path::new("/idx"), Path::new("/w/r.fastq"), Path::new("/w/star/"), 4, true)
            .to_string();
        assert!(star.contains("--outFilterMultimapNmax 1 "));
        let te = tecount(
            Path::new("/w/a.bam"),
            Path::new("/g.gtf"),
            Path::new("/te.gtf"),
            Path::new("/w/te_counts"),
            "raw",
            false,
        )
        .to_string();
        assert!(te.contains("--mode multi"));
        let fc = featurecounts(Path::new("/w/a.bam"), Path::new("/g.gtf"), Path::new("/w/o.tsv"), 2, true)
            .to_string();
        assert_eq!(fc, "featureCounts -T 2 -a /g.gtf -o /w/o.tsv /w/a.bam");
    }
}
