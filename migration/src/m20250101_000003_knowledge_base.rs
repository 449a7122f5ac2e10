use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(KbDocs::Table)
                    .if_not_exists()
                    .col(string(KbDocs::Id).primary_key())
                    .col(string(KbDocs::Title))
                    .col(string(KbDocs::Source))
                    .col(string(KbDocs::Language).default("en"))
                    .col(string_null(KbDocs::Url))
                    .col(text(KbDocs::Content))
                    .col(integer(KbDocs::WordCount))
                    .col(boolean(KbDocs::IsActive).default(true))
                    .col(big_integer(KbDocs::CreatedAt))
                    .to_owned(),
            )
            .await?;

        // Chunks carry their embedding as a JSON float array; on PostgreSQL
        // a pgvector column can be layered on top without changing this table
        manager
            .create_table(
                Table::create()
                    .table(KbChunks::Table)
                    .if_not_exists()
                    .col(string(KbChunks::Id).primary_key())
                    .col(string(KbChunks::DocId))
                    .col(integer(KbChunks::Ord))
                    .col(text(KbChunks::Text))
                    .col(integer(KbChunks::StartChar))
                    .col(integer(KbChunks::EndChar))
                    .col(text(KbChunks::Embedding))
                    .col(big_integer(KbChunks::CreatedAt))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_kb_chunks_doc")
                            .from(KbChunks::Table, KbChunks::DocId)
                            .to(KbDocs::Table, KbDocs::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_kb_chunks_doc")
                    .table(KbChunks::Table)
                    .col(KbChunks::DocId)
                    .col(KbChunks::Ord)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(KbChunks::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(KbDocs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum KbDocs {
    Table,
    Id,
    Title,
    Source,
    Language,
    Url,
    Content,
    WordCount,
    IsActive,
    CreatedAt,
}

#[derive(DeriveIden)]
enum KbChunks {
    Table,
    Id,
    DocId,
    Ord,
    Text,
    StartChar,
    EndChar,
    Embedding,
    CreatedAt,
}
